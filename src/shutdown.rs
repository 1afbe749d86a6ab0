use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received,
/// or when every installed signal stream closes. If neither handler can be installed
/// the token is only cancelled by its other holders.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = installed(signal(SignalKind::terminate()), "SIGTERM");
        let mut sigint = installed(signal(SignalKind::interrupt()), "SIGINT");
        if sigterm.is_none() && sigint.is_none() {
            return;
        }
        let (watch_term, watch_int) = (sigterm.is_some(), sigint.is_some());

        tokio::select! {
            Some(_) = recv(&mut sigterm), if watch_term => {
                tracing::info!("Received SIGTERM, shutting down");
            }
            Some(_) = recv(&mut sigint), if watch_int => {
                tracing::info!("Received SIGINT, shutting down");
            }
            else => {
                tracing::warn!("Signal streams closed, shutting down");
            }
        }

        token_clone.cancel();
    });

    token
}

fn installed(stream: std::io::Result<Signal>, name: &str) -> Option<Signal> {
    stream
        .map_err(|e| tracing::error!(signal = name, error = %e, "Failed to install signal handler"))
        .ok()
}

async fn recv(stream: &mut Option<Signal>) -> Option<()> {
    stream.as_mut()?.recv().await
}

/// Shut the engine down once `token` is cancelled, killing every running component.
///
/// Maps stay on disk; their unfinished components are requeued the next time they
/// are loaded.
pub async fn shutdown_engine_on(token: CancellationToken, engine: Arc<Engine>) {
    token.cancelled().await;
    engine.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_signal_stream_yields_nothing() {
        assert_eq!(recv(&mut None).await, None);
    }

    #[tokio::test]
    async fn handler_token_starts_uncancelled() {
        let token = install_shutdown_handler();
        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
    }
}
