//! # gwmcp
//!
//! Upstream registration pipeline and session routing for the MCP
//! gateway: reconciles discovered tools/prompts/resources against
//! declarative overrides, publishes proxy handles to the external
//! managers, and tracks the upstream/downstream session pairing needed
//! to route server-initiated requests back to their origin.

pub mod error;
pub mod managers;
pub mod registration;
pub mod session;

pub use error::{RegistrationError, Result};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
