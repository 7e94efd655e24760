//! gpulet-exec: Child process supervision
//!
//! This crate runs submitted scripts as supervised child processes:
//! - Interpreter selection and device binding via the environment
//! - Wall-clock timeout and cooperative cancellation
//! - Process-group termination with a kill grace period
//! - Bounded capture of combined child output

pub mod command;
pub mod supervisor;

pub use command::build_command;
pub use supervisor::{ExecRequest, Outcome, ProcessPhase, ProcessSupervisor, Supervise};
