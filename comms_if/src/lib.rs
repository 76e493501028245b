//! # Communications interface crate.
//!
//! Provides the topic definitions and the publish/subscribe bus used by all executables.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Topic identifiers and message records
pub mod topic;

/// The bus interface and the in-process bus
pub mod bus;

/// Network module
#[cfg(feature = "net")]
pub mod net;
