//! gpulet-api: REST API server for gpulet
//!
//! This crate provides the REST API for interacting with gpulet:
//! - Task submission and cancellation
//! - Task and GPU inventory queries
//! - System status

pub mod rest;

pub use rest::create_router;
