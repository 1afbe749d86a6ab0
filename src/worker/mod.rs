//! Process execution for map components.
//!
//! - **Local mode**: `sh -c <command> jobmap <args...>` in a dedicated process group,
//!   so stop/continue/kill reach every process the shell starts
//! - **Docker mode**: one sandboxed container per execution, controlled with
//!   `docker pause`, `docker unpause` and `docker rm -f`
//!
//! # Execution Flow
//!
//! 1. The engine assigns an idle component to a slot
//! 2. [`ComponentExecutor::spawn`] starts the process and returns a handle
//! 3. [`ComponentExecutor::wait`] captures stdout/stderr and the exit status,
//!    unless the engine asks for the process to be killed first
//! 4. The engine stores the [`ExecutionResult`](executor::ExecutionResult)

pub mod executor;

pub use executor::{
    ComponentExecutor, ExecutionResult, LaunchSpec, Outcome, ProcessHandle, ProcessSignal,
    RunningProcess,
};
