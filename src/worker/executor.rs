use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{ExecutionMode, SandboxConfig};
use crate::scheduler::{ComponentKey, ComponentStatus};

/// Everything needed to start one component process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: ComponentKey,
    /// Unique name for this execution, used as the container name in Docker mode
    pub name: String,
    /// Shell command; the component's arguments are available as `$1`, `$2`, ...
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory for the process, collected as the component's output files
    pub output_dir: PathBuf,
    pub memory_mb: u64,
}

/// Enough information to signal a running component from outside its worker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub container: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Stop,
    Continue,
    Kill,
}

impl ProcessSignal {
    fn kill_arg(self) -> &'static str {
        match self {
            ProcessSignal::Stop => "-STOP",
            ProcessSignal::Continue => "-CONT",
            ProcessSignal::Kill => "-KILL",
        }
    }

    /// `docker kill` refuses paused containers, so kills force-remove instead.
    fn docker_args(self) -> &'static [&'static str] {
        match self {
            ProcessSignal::Stop => &["pause"],
            ProcessSignal::Continue => &["unpause"],
            ProcessSignal::Kill => &["rm", "-f"],
        }
    }
}

/// A spawned component process.
#[derive(Debug)]
pub struct RunningProcess {
    pub key: ComponentKey,
    pub handle: ProcessHandle,
    child: Child,
    started: Instant,
}

/// Result of component execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub key: ComponentKey,
    pub status: ComponentStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

#[derive(Debug)]
pub enum Outcome {
    Finished(ExecutionResult),
    /// The process was killed on request; its output is discarded.
    Killed,
}

/// Runs component commands locally or in sandboxed Docker containers.
#[derive(Debug, Clone)]
pub struct ComponentExecutor {
    mode: ExecutionMode,
    sandbox: SandboxConfig,
}

impl Default for ComponentExecutor {
    fn default() -> Self {
        Self::local()
    }
}

impl ComponentExecutor {
    pub fn new(mode: ExecutionMode, sandbox: SandboxConfig) -> Self {
        Self { mode, sandbox }
    }

    pub fn local() -> Self {
        Self::new(ExecutionMode::Local, SandboxConfig::default())
    }

    fn component_env(spec: &LaunchSpec, output_dir: &str) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "JOBMAP_COMPONENT".to_string(),
                spec.key.component.to_string(),
            ),
            ("JOBMAP_INPUT".to_string(), spec.args.join(" ")),
            ("JOBMAP_OUTPUT_DIR".to_string(), output_dir.to_string()),
        ];
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn local_command(spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .arg("jobmap")
            .args(&spec.args)
            .current_dir(&spec.output_dir)
            .envs(Self::component_env(
                spec,
                &spec.output_dir.to_string_lossy(),
            ));
        // Own process group so signals reach everything the shell starts
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn docker_command(&self, spec: &LaunchSpec) -> Command {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", spec.name),
        ];

        // Network isolation
        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }

        args.push(format!("--memory={}m", spec.memory_mb));

        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(format!("--volume={}:/output", spec.output_dir.display()));
        args.push("--workdir=/output".to_string());
        for (key, value) in Self::component_env(spec, "/output") {
            args.push(format!("--env={}={}", key, value));
        }

        args.push(self.sandbox.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.command.clone());
        args.push("jobmap".to_string());
        args.extend(spec.args.iter().cloned());

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }

    /// Start the component process.
    pub async fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<RunningProcess> {
        tracing::info!(component = %spec.key, command = %spec.command, mode = ?self.mode, "Executing component");

        tokio::fs::create_dir_all(&spec.output_dir).await?;

        let mut cmd = match self.mode {
            ExecutionMode::Local => Self::local_command(spec),
            ExecutionMode::Docker => self.docker_command(spec),
        };
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let handle = ProcessHandle {
            pid: child.id(),
            container: match self.mode {
                ExecutionMode::Local => None,
                ExecutionMode::Docker => Some(spec.name.clone()),
            },
        };

        Ok(RunningProcess {
            key: spec.key,
            handle,
            child,
            started: Instant::now(),
        })
    }

    /// Wait for the process to exit, or kill it when `kill_rx` fires.
    pub async fn wait(&self, process: RunningProcess, mut kill_rx: oneshot::Receiver<()>) -> Outcome {
        let RunningProcess {
            key,
            handle,
            mut child,
            started,
        } = process;

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        tokio::select! {
            status = child.wait() => {
                let stdout = collect_reader(stdout_reader).await;
                let stderr = collect_reader(stderr_reader).await;
                Outcome::Finished(Self::process_output(key, status, stdout, stderr, started.elapsed()))
            }
            Ok(()) = &mut kill_rx => {
                if let Err(e) = self.signal(&handle, ProcessSignal::Kill).await {
                    tracing::debug!(component = %key, error = %e, "Group kill failed, killing shell only");
                }
                let _ = child.kill().await;
                stdout_reader.abort();
                stderr_reader.abort();
                tracing::info!(component = %key, "Component process killed");
                Outcome::Killed
            }
        }
    }

    /// Spawn and wait without the possibility of being killed.
    /// Failure to start is reported as an errored result.
    pub async fn execute(&self, spec: &LaunchSpec) -> ExecutionResult {
        let process = match self.spawn(spec).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(component = %spec.key, error = %e, "Component failed to start");
                return ExecutionResult {
                    key: spec.key,
                    status: ComponentStatus::Errored,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    runtime: Duration::ZERO,
                };
            }
        };

        let (_kill_tx, kill_rx) = oneshot::channel();
        match self.wait(process, kill_rx).await {
            Outcome::Finished(result) => result,
            Outcome::Killed => ExecutionResult {
                key: spec.key,
                status: ComponentStatus::Errored,
                exit_code: None,
                stdout: String::new(),
                stderr: "killed".to_string(),
                runtime: Duration::ZERO,
            },
        }
    }

    fn signal_command(handle: &ProcessHandle, signal: ProcessSignal) -> Option<Command> {
        if let Some(ref container) = handle.container {
            let mut cmd = Command::new("docker");
            cmd.args(signal.docker_args()).arg(container);
            Some(cmd)
        } else if let Some(pid) = handle.pid {
            let mut cmd = Command::new("kill");
            cmd.arg(signal.kill_arg()).arg("--").arg(format!("-{}", pid));
            Some(cmd)
        } else {
            None
        }
    }

    /// Deliver a signal to a running component.
    pub async fn signal(&self, handle: &ProcessHandle, signal: ProcessSignal) -> std::io::Result<()> {
        let Some(mut cmd) = Self::signal_command(handle, signal) else {
            return Err(std::io::Error::other("process has already exited"));
        };

        let status = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "signal {:?} exited with {}",
                signal, status
            )))
        }
    }

    fn process_output(
        key: ComponentKey,
        result: std::io::Result<std::process::ExitStatus>,
        stdout: String,
        stderr: String,
        runtime: Duration,
    ) -> ExecutionResult {
        match result {
            Ok(exit) => {
                let exit_code = exit.code();
                let status = if exit.success() {
                    ComponentStatus::Completed
                } else {
                    ComponentStatus::Errored
                };

                tracing::info!(
                    component = %key,
                    status = %status,
                    exit_code = ?exit_code,
                    runtime_ms = runtime.as_millis() as u64,
                    "Component finished"
                );

                ExecutionResult {
                    key,
                    status,
                    exit_code,
                    stdout,
                    stderr,
                    runtime,
                }
            }
            Err(e) => {
                tracing::error!(component = %key, error = %e, "Component execution failed");
                ExecutionResult {
                    key,
                    status: ComponentStatus::Errored,
                    exit_code: None,
                    stdout,
                    stderr: if stderr.is_empty() { e.to_string() } else { stderr },
                    runtime,
                }
            }
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect_reader(reader: JoinHandle<Vec<u8>>) -> String {
    reader
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
