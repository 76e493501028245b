//! # Dispatch types
//!
//! Per-topic handlers and the state they work on. Each wake-up the node copies every ready topic
//! into [`ObservedInputs`], then runs the handler of each ready topic. A handler is a pure
//! transform of the new message and the observed inputs into zero or more output records, which
//! it writes with [`DerivedOutputs::update`]. Writing a record marks it dirty, and the node
//! publishes dirty records once all handlers of the wake-up have run.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use comms_if::{
    bus::PubHandle,
    topic::{Msg, SensorCombined, TopicId, VehicleThrustSetpoint},
};

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A per-topic handler.
///
/// Any `FnMut(&Msg, &ObservedInputs, &mut DerivedOutputs) -> Result<(), HandlerError>` is a
/// handler, so plain functions and closures can go straight into a handler table.
pub trait TopicHandler {
    /// Handle a freshly copied message.
    ///
    /// `inputs` already contains `msg` as well as the latest copy of every other topic observed so
    /// far, including those that became ready in the same wake-up.
    fn handle(
        &mut self,
        msg: &Msg,
        inputs: &ObservedInputs,
        outputs: &mut DerivedOutputs,
    ) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

/// Latest copy of each input topic seen since the node started.
///
/// A topic missing from here has never been observed, handlers must treat it as absent rather than
/// as zero.
#[derive(Debug, Default)]
pub struct ObservedInputs {
    latest: HashMap<TopicId, Msg>,
}

/// The output records owned by the node, in publish order.
#[derive(Debug, Default)]
pub struct DerivedOutputs {
    records: Vec<OutputRecord>,
}

/// One output record and its publisher.
#[derive(Debug)]
pub struct OutputRecord {
    pub topic: TopicId,
    pub publisher: PubHandle,
    pub msg: Msg,
    dirty: bool,
}

// ---------------------------------------------------------------------------
// ENUMS
// ---------------------------------------------------------------------------

/// Errors a handler can report. They are logged and the wake-up carries on.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Output {0} was not advertised by this node")]
    OutputNotAdvertised(TopicId),

    #[error("Handler for {expected} was given a {found} message")]
    UnexpectedMsg { expected: TopicId, found: TopicId },
}

// ---------------------------------------------------------------------------
// IMPLS
// ---------------------------------------------------------------------------

impl<F> TopicHandler for F
where
    F: FnMut(&Msg, &ObservedInputs, &mut DerivedOutputs) -> Result<(), HandlerError>,
{
    fn handle(
        &mut self,
        msg: &Msg,
        inputs: &ObservedInputs,
        outputs: &mut DerivedOutputs,
    ) -> Result<(), HandlerError> {
        self(msg, inputs, outputs)
    }
}

impl ObservedInputs {
    /// Record a freshly copied message, replacing the previous one of the same topic.
    pub fn record(&mut self, msg: Msg) {
        self.latest.insert(msg.topic(), msg);
    }

    /// Latest message of a topic, `None` if it has never been observed.
    pub fn get(&self, topic: TopicId) -> Option<&Msg> {
        self.latest.get(&topic)
    }

    pub fn has_observed(&self, topic: TopicId) -> bool {
        self.latest.contains_key(&topic)
    }

    pub fn sensor_combined(&self) -> Option<&SensorCombined> {
        self.get(TopicId::SensorCombined)
            .and_then(Msg::as_sensor_combined)
    }

    pub fn vehicle_thrust_setpoint(&self) -> Option<&VehicleThrustSetpoint> {
        self.get(TopicId::VehicleThrustSetpoint)
            .and_then(Msg::as_vehicle_thrust_setpoint)
    }
}

impl DerivedOutputs {
    /// Add a zero-initialised record for an advertised output.
    pub(crate) fn add(&mut self, topic: TopicId, publisher: PubHandle) {
        self.records.push(OutputRecord {
            topic,
            publisher,
            msg: Msg::zeroed(topic),
            dirty: false,
        })
    }

    /// Overwrite the record of the message's topic and mark it for publishing.
    pub fn update(&mut self, msg: Msg) -> Result<(), HandlerError> {
        let topic = msg.topic();

        let record = self
            .records
            .iter_mut()
            .find(|r| r.topic == topic)
            .ok_or(HandlerError::OutputNotAdvertised(topic))?;

        record.msg = msg;
        record.dirty = true;

        Ok(())
    }

    /// Current content of an output record.
    pub fn get(&self, topic: TopicId) -> Option<&Msg> {
        self.records
            .iter()
            .find(|r| r.topic == topic)
            .map(|r| &r.msg)
    }

    /// Whether the record has been written since it was last published.
    pub fn is_dirty(&self, topic: TopicId) -> bool {
        self.records.iter().any(|r| r.topic == topic && r.dirty)
    }

    /// Records due for publishing, in publish order.
    pub(crate) fn dirty(&self) -> impl Iterator<Item = &OutputRecord> {
        self.records.iter().filter(|r| r.dirty)
    }

    pub(crate) fn clear_dirty(&mut self) {
        for r in self.records.iter_mut() {
            r.dirty = false;
        }
    }

    pub fn contains(&self, topic: TopicId) -> bool {
        self.records.iter().any(|r| r.topic == topic)
    }
}

/// Borrow the typed record out of `msg`, or fail with [`HandlerError::UnexpectedMsg`].
pub fn expect_msg<'m, T, F>(
    msg: &'m Msg,
    expected: TopicId,
    accessor: F,
) -> Result<&'m T, HandlerError>
where
    F: FnOnce(&'m Msg) -> Option<&'m T>,
{
    accessor(msg).ok_or(HandlerError::UnexpectedMsg {
        expected,
        found: msg.topic(),
    })
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
