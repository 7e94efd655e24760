//! gpulet-script: Script classification and GPU requirement extraction
//!
//! Everything here is pure text analysis: scripts are never executed to
//! discover what they need.

pub mod classify;
pub mod extract;

pub use classify::classify;
pub use extract::{parse_device_spec, RequirementExtractor};
