//! gpulet-scheduler: GPU-aware task scheduler for gpulet
//!
//! This crate decides which task runs next and on which devices:
//! - Exclusive GPU reservation and release
//! - FIFO admission with configurable head-of-line handling
//! - Task lifecycle tracking from submission to completion

pub mod allocator;
pub mod scheduler;

pub use allocator::GpuAllocator;
pub use scheduler::{Scheduler, SystemStatus};
