//! # Subscriptions
//!
//! The node's input subscriptions, kept in registration order. Index `i` of the handle array
//! passed to the bus wait is always the subscription registered `i`-th.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use log::{debug, warn};

use comms_if::{
    bus::{Bus, BusError, SubHandle},
    topic::TopicId,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub topic: TopicId,
    pub handle: SubHandle,
    pub period: Duration,
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    subs: Vec<Subscription>,

    /// Handles in registration order, kept alongside `subs` so a wait can borrow them as a slice.
    handles: Vec<SubHandle>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Topic {0} is already subscribed")]
    Duplicate(TopicId),

    #[error("Could not subscribe to {0}: {1}")]
    Subscribe(TopicId, BusError),

    #[error("Could not set the interval of {0}: {1}")]
    SetInterval(TopicId, BusError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic` and apply its minimum update interval.
    ///
    /// Returns the index of the new subscription. If the interval cannot be set the subscription
    /// is released again before the error is returned.
    pub fn register<B: Bus>(
        &mut self,
        bus: &mut B,
        topic: TopicId,
        period: Duration,
    ) -> Result<usize, SubscribeError> {
        if self.position(topic).is_some() {
            return Err(SubscribeError::Duplicate(topic));
        }

        let handle = bus
            .subscribe(topic)
            .map_err(|e| SubscribeError::Subscribe(topic, e))?;

        if let Err(e) = bus.set_interval(handle, period) {
            bus.unsubscribe(handle).ok();
            return Err(SubscribeError::SetInterval(topic, e));
        }

        debug!(
            "Subscribed to {} (index {}, interval {} ms)",
            topic,
            self.subs.len(),
            period.as_millis()
        );

        self.subs.push(Subscription {
            topic,
            handle,
            period,
        });
        self.handles.push(handle);

        Ok(self.subs.len() - 1)
    }

    /// Handles in registration order.
    pub fn handles(&self) -> &[SubHandle] {
        &self.handles
    }

    pub fn get(&self, index: usize) -> Option<&Subscription> {
        self.subs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.iter()
    }

    pub fn position(&self, topic: TopicId) -> Option<usize> {
        self.subs.iter().position(|s| s.topic == topic)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Release every subscription. Failures are logged and do not stop the others being released.
    pub fn unsubscribe_all<B: Bus>(&mut self, bus: &mut B) {
        for sub in self.subs.drain(..) {
            match bus.unsubscribe(sub.handle) {
                Ok(()) => debug!("Unsubscribed from {}", sub.topic),
                Err(e) => warn!("Could not unsubscribe from {}: {}", sub.topic, e),
            }
        }
        self.handles.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
