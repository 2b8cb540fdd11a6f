//! # Shared Module for the Offline Verification Kiosk
//!
//! This crate provides the data model, errors, configuration and digest
//! helpers used by the device client and the benchmark suite.
//!
//! ## Trust model
//!
//! A kiosk keeps working without network connectivity:
//! - **Cached credentials** carry an offline validity horizon distinct from their expiry
//! - **Biometric templates** are stored encrypted, tagged with the key that sealed them
//! - **Verification results** produced offline stay provisional until reconciled
//! - **Audit entries** are redacted on the device before they reach the ledger

pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use error::*;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
