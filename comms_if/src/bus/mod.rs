//! # Bus Interface
//!
//! The publish/subscribe bus connecting producers and consumers of topic messages. Nodes only ever
//! talk to the bus through the [`Bus`] trait, so the same node can run on the in-process
//! [`LocalBus`] or on the networked bus in [`crate::net`].
//!
//! The contract mirrors the classic autopilot object-request-broker model:
//!
//! - A subscriber gets a [`SubHandle`] and may cap how often that handle is reported ready.
//! - [`Bus::wait`] blocks on a whole set of handles at once and reports which of them have unread
//!   data, or a timeout, or a failure of the wait mechanism itself.
//! - [`Bus::copy_latest`] copies the most recent message of a topic and marks it as read for that
//!   handle.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod local;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{collections::BTreeSet, fmt, time::Duration};
use thiserror::Error;

use crate::topic::{Msg, TopicId};

pub use local::LocalBus;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Operations a node needs from the publish/subscribe bus.
pub trait Bus {
    /// Subscribe to the given topic.
    ///
    /// Fails with [`BusError::UnknownTopic`] if the bus does not carry the topic.
    fn subscribe(&mut self, topic: TopicId) -> Result<SubHandle, BusError>;

    /// Set the minimum period between two deliveries on `handle`.
    ///
    /// The bus will not report the handle ready more often than this regardless of how fast the
    /// topic is published. A zero period removes the limit.
    fn set_interval(&mut self, handle: SubHandle, period: Duration) -> Result<(), BusError>;

    /// Release a subscription. The handle is never handed out again.
    fn unsubscribe(&mut self, handle: SubHandle) -> Result<(), BusError>;

    /// Advertise a topic and publish `initial` on it.
    fn advertise(&mut self, topic: TopicId, initial: &Msg) -> Result<PubHandle, BusError>;

    /// Publish a message through an advertised publisher.
    fn publish(&mut self, publisher: PubHandle, msg: &Msg) -> Result<(), BusError>;

    /// Block until at least one of `handles` has unread data or `timeout` elapses.
    ///
    /// Indices in the returned [`ReadySet`] are positions in `handles`.
    fn wait(&mut self, handles: &[SubHandle], timeout: Duration) -> WaitOutcome;

    /// Copy the latest message on the handle's topic, or `None` if nothing has ever been published.
    fn copy_latest(&mut self, handle: SubHandle) -> Result<Option<Msg>, BusError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Opaque reference to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub(crate) usize);

/// Opaque reference to an advertised publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub(crate) usize);

/// The set of positions in a wait call's handle list that have unread data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    indices: BTreeSet<usize>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of a multiplexed wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One or more handles have data.
    Ready(ReadySet),

    /// No handle became ready before the timeout. Providers are silent, which is not necessarily
    /// an error.
    Timeout,

    /// The wait mechanism itself failed.
    Error(WaitError),
}

/// Failure of the wait mechanism, as distinct from "no data".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("Handle {0:?} is not a live subscription")]
    InvalidHandle(SubHandle),

    #[error("The bus registry lock was poisoned by a panicking publisher")]
    Poisoned,

    #[error("poll() failed with code {0}")]
    Poll(i32),
}

/// Errors raised by bus registration, copy and publish operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Topic {0} is not known to the bus")]
    UnknownTopic(TopicId),

    #[error("Subscription handle {0:?} is not valid")]
    InvalidSubHandle(SubHandle),

    #[error("Publisher handle {0:?} is not valid")]
    InvalidPubHandle(PubHandle),

    #[error("A {found} message cannot be published on the {expected} topic")]
    TopicMismatch { expected: TopicId, found: TopicId },

    #[error("The bus registry lock was poisoned")]
    Poisoned,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Could not encode or decode a message: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SubHandle {
    /// Build a handle from a raw index. Only bus implementations should need this.
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }

    /// The raw index of the handle, useful for logging.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl PubHandle {
    /// Build a handle from a raw index. Only bus implementations should need this.
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }

    /// The raw index of the handle, useful for logging.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl ReadySet {
    /// An empty ready set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the handle at `index` as ready.
    pub fn insert(&mut self, index: usize) {
        self.indices.insert(index);
    }

    /// Return true if the handle at `index` is ready.
    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Number of ready handles.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Ready indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// Drop every index that does not refer to one of `num_handles` handles, returning how many
    /// were dropped.
    pub fn retain_below(&mut self, num_handles: usize) -> usize {
        let before = self.indices.len();
        self.indices.retain(|&i| i < num_handles);
        before - self.indices.len()
    }
}

impl std::iter::FromIterator<usize> for ReadySet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            indices: iter.into_iter().collect(),
        }
    }
}

impl WaitError {
    /// Numeric code of the error, negative in the manner of `poll()` return values.
    pub fn code(&self) -> i32 {
        match self {
            WaitError::InvalidHandle(_) => -22,
            WaitError::Poisoned => -5,
            WaitError::Poll(c) => *c,
        }
    }
}

impl fmt::Display for SubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ready_set() {
        let mut set: ReadySet = vec![3, 0, 7, 0].into_iter().collect();

        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 7]);

        // Only two handles were waited on, so 3 and 7 are bogus
        assert_eq!(set.retain_below(2), 2);
        assert!(set.contains(0));
        assert!(!set.contains(3));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_wait_error_codes() {
        assert_eq!(WaitError::Poll(-4).code(), -4);
        assert!(WaitError::InvalidHandle(SubHandle(2)).code() < 0);
    }
}
