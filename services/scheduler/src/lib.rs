//! hydromaas scheduler library.
//!
//! The crate ships a `scheduler` binary; the library surface exists for
//! integration testing and reuse.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod launcher;
pub mod resources;
pub mod state;
pub mod store;
