//! Scenario execution engine
//!
//! Process supervision, the global process registry and the worker pool.

mod command;
mod dispatcher;
pub mod registry;
mod signal;
mod supervisor;

pub use command::{CommandSpec, CommandTemplate, EnvForwarding};
pub use dispatcher::{WorkerPool, DEFAULT_SCENARIO_TIMEOUT, DEFAULT_WORKERS};
pub use registry::{shutdown_signal, ProcessRegistry, SIGNAL_EXIT_CODE};
pub use supervisor::{ExecOptions, Supervisor, DEFAULT_GRACE};
