//! Map shell commands over lists of inputs as batches of locally scheduled jobs.
//!
//! Each input becomes one component of a [`Map`]. Components run on a fixed number of
//! execution slots managed by the [`Engine`], can be held, released, paused, resumed and
//! vacated as a group, and leave their outputs and logs in a per-map directory so a map
//! can be reloaded by tag after a restart.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod map;
pub mod mapping;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod tags;
pub mod utils;
pub mod worker;

pub use config::{EngineConfig, ExecutionMode, SandboxConfig};
pub use engine::Engine;
pub use error::{MapError, Result};
pub use map::{ComponentError, Map, WaitOptions};
pub use mapping::{MapOptions, MappedCommand};
pub use scheduler::{ComponentHold, ComponentStatus, JobAction, MapId, StatusCounts};
