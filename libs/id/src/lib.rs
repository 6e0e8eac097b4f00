//! # hydromaas-id
//!
//! Stable ID types, parsing, and validation for the hydromaas scheduler.
//!
//! ## Design Principles
//!
//! - Job IDs are plain UUIDs so that callers may supply their own
//! - Resource IDs are operator-chosen names, validated so they can be embedded
//!   in namespaced store keys
//! - Allocation IDs are derived from the resource they were carved from and
//!   the instant they were created
//! - All IDs roundtrip through their canonical string form
//!
//! ## ID Format
//!
//! - `JobId`: `0b9e1c52-8a53-4f5e-9f0c-7d4a61a1d3c2`
//! - `ResourceId`: `node-0001`
//! - `AllocationId`: `node-0001_20260101T120000.000000001Z`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
