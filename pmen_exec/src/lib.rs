//! # PMEN node library
//!
//! The multiplexed poll/dispatch node. The node subscribes to a set of input topics, blocks on all
//! of them at once, runs a per-topic handler for each topic that has new data and publishes the
//! outputs those handlers derived.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Handler trait, observed inputs and derived output records
pub mod dispatch;

/// The concrete handler table: attitude and actuator controls from sensor and thrust data
pub mod handlers;

/// The poll/dispatch loop
pub mod node;

/// Executable parameters
pub mod params;

/// Simulated and replayed publishers for running on the local bus
pub mod source;

/// Input subscriptions in registration order
pub mod subscription;

/// Multiplexed wait and wait error throttling
pub mod waiter;

#[cfg(test)]
mod mock_bus;
