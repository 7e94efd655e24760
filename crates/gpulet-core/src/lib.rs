//! gpulet-core: Core types and traits for the gpulet scheduler
//!
//! This crate provides the fundamental types used throughout the gpulet system:
//! - Task model and lifecycle statuses
//! - GPU inventory probing
//! - Task lifecycle events
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod event;
pub mod gpu;
pub mod task;

pub use config::*;
pub use error::*;
pub use event::*;
pub use gpu::*;
pub use task::*;
