//! buildsmith - Build service for the Vessel core and its plugins
//!
//! Materializes reproducible per-request workspaces from a shared master
//! package cache, verifies plugin compatibility, cross-compiles, signs
//! the resulting archive, and streams it back. Deploy operations promote
//! new core or plugin versions into the cache, gated on verification.

pub mod archive;
pub mod buildenv;
pub mod cache;
pub mod config;
pub mod copy;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod inject;
pub mod platform;
pub mod request;
pub mod server;
pub mod sign;

pub use error::{SmithError, SmithResult};
