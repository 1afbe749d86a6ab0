use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where component processes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// `sh -c` on the local machine, one process group per component.
    #[default]
    Local,
    /// Sandboxed Docker containers, see [`SandboxConfig`].
    Docker,
}

/// Configuration for Docker-based component execution.
///
/// Containers run with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory limit taken from the map's memory request
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image to use for component execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding map data, tag files and removed tags
    pub root_dir: PathBuf,
    /// Number of components that may execute at the same time
    pub slots: usize,
    /// Memory budget shared by running components, in MB
    pub memory_mb: u64,
    /// How often the scheduler looks for work and waiters re-check state
    pub poll_interval_ms: u64,
    /// Maximum number of components across all live maps
    pub max_components: usize,
    pub execution: ExecutionMode,
    pub sandbox: SandboxConfig,
    /// Address for the HTTP API, if it should be served
    pub api_addr: Option<SocketAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            slots: 4,
            memory_mb: 4096,
            poll_interval_ms: 250,
            max_components: 10_000,
            execution: ExecutionMode::Local,
            sandbox: SandboxConfig::default(),
            api_addr: None,
        }
    }
}

impl EngineConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_max_components(mut self, max_components: usize) -> Self {
        self.max_components = max_components;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `$JOBMAP_DIR`, falling back to `$HOME/.jobmap` and then `./.jobmap`.
pub fn default_root_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("JOBMAP_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".jobmap"),
        None => PathBuf::from(".jobmap"),
    }
}
