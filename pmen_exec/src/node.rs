//! # Node
//!
//! The poll/dispatch loop. One cycle of the loop is:
//!
//! 1. Check for cancellation.
//! 2. Wait on every input subscription for up to the wait timeout.
//! 3. On a ready wake-up, copy every ready topic into the observed inputs, then run the handler of
//!    each ready topic in registration order.
//! 4. Publish every output record written during the wake-up, once each, in advertise order.
//!
//! Timeouts and wait errors end the cycle without dispatching. Wait errors are counted and their
//! logging throttled by the [`Waiter`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, trace, warn};
use serde::Serialize;

use comms_if::{
    bus::{Bus, BusError, ReadySet, WaitOutcome},
    topic::{Msg, TopicId},
};

use crate::{
    dispatch::{DerivedOutputs, HandlerError, ObservedInputs, TopicHandler},
    subscription::{SubscribeError, Subscriptions},
    waiter::Waiter,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Shared flag used to stop a running node from another thread or a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

/// An input topic and the handler run when it has new data.
pub struct InputSpec {
    pub topic: TopicId,

    /// Minimum time between two copies of the topic
    pub period: Duration,

    pub handler: Box<dyn TopicHandler>,
}

pub struct NodeConfig {
    /// Inputs in registration order
    pub inputs: Vec<InputSpec>,

    /// Outputs in advertise order, which is also the publish order
    pub outputs: Vec<TopicId>,

    pub wait_timeout: Duration,

    /// Number of cycles to run before stopping, `None` to run until cancelled
    pub cycle_budget: Option<u64>,
}

/// Counters describing a run, saved into the session at exit.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub cycles: u64,
    pub wait_calls: u64,
    pub ready_wakeups: u64,
    pub timeouts: u64,
    pub wait_errors: u64,
    pub logged_wait_errors: u64,

    /// Topics reported ready which had no data to copy
    pub empty_copies: u64,
    pub copy_errors: u64,
    pub handler_errors: u64,
    pub publish_errors: u64,

    /// Number of handler runs per input topic
    pub dispatched: BTreeMap<String, u64>,

    /// Number of publishes per output topic
    pub published: BTreeMap<String, u64>,

    pub cancelled: bool,
}

pub struct Node<B: Bus> {
    bus: B,
    subs: Subscriptions,
    handlers: Vec<Box<dyn TopicHandler>>,
    observed: ObservedInputs,
    outputs: DerivedOutputs,
    waiter: Waiter,
    cycle_budget: Option<u64>,
    state: LoopState,
    report: RunReport,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Blocked in the bus wait
    Waiting,

    /// Copying ready inputs, running handlers and publishing
    Dispatching,

    /// Between cycles
    Idle,

    /// Stopped by cancellation or by the cycle budget
    Done,
}

/// What happened during one call to [`Node::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Dispatched {
        /// Input topics whose handler ran, in the order they ran
        handled: Vec<TopicId>,

        /// Output topics published, in the order they were published
        published: Vec<TopicId>,
    },
    Timeout,
    WaitError,
    Cancelled,

    /// The node had already stopped, nothing was done
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("The node has no inputs to wait on")]
    NoInputs,

    #[error("No handler is registered for input topic {0}")]
    NoHandler(TopicId),

    #[error("Output topic {0} is listed more than once")]
    DuplicateOutput(TopicId),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("Could not advertise {0}: {1}")]
    Advertise(TopicId, BusError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl InputSpec {
    pub fn new(topic: TopicId, period: Duration, handler: Box<dyn TopicHandler>) -> Self {
        Self {
            topic,
            period,
            handler,
        }
    }

    /// Build an input from a closure.
    pub fn with_fn<F>(topic: TopicId, period: Duration, f: F) -> Self
    where
        F: FnMut(&Msg, &ObservedInputs, &mut DerivedOutputs) -> Result<(), HandlerError> + 'static,
    {
        Self::new(topic, period, Box::new(f))
    }
}

impl RunReport {
    pub fn dispatch_count(&self, topic: TopicId) -> u64 {
        self.dispatched.get(topic.name()).copied().unwrap_or(0)
    }

    pub fn publish_count(&self, topic: TopicId) -> u64 {
        self.published.get(topic.name()).copied().unwrap_or(0)
    }
}

impl<B: Bus> Node<B> {
    /// Subscribe to every input and advertise every output.
    ///
    /// Outputs are advertised with zeroed records. If any registration fails, the subscriptions
    /// made so far are released before the error is returned.
    pub fn new(mut bus: B, config: NodeConfig) -> Result<Self, NodeError> {
        if config.inputs.is_empty() {
            return Err(NodeError::NoInputs);
        }

        let mut subs = Subscriptions::new();
        let mut handlers = Vec::with_capacity(config.inputs.len());

        for input in config.inputs {
            if let Err(e) = subs.register(&mut bus, input.topic, input.period) {
                subs.unsubscribe_all(&mut bus);
                return Err(e.into());
            }
            handlers.push(input.handler);
        }

        let mut outputs = DerivedOutputs::default();

        for topic in config.outputs {
            if outputs.contains(topic) {
                subs.unsubscribe_all(&mut bus);
                return Err(NodeError::DuplicateOutput(topic));
            }

            match bus.advertise(topic, &Msg::zeroed(topic)) {
                Ok(publisher) => {
                    debug!("Advertised {}", topic);
                    outputs.add(topic, publisher)
                }
                Err(e) => {
                    subs.unsubscribe_all(&mut bus);
                    return Err(NodeError::Advertise(topic, e));
                }
            }
        }

        let state = match config.cycle_budget {
            Some(0) => LoopState::Done,
            _ => LoopState::Waiting,
        };

        Ok(Self {
            bus,
            subs,
            handlers,
            observed: ObservedInputs::default(),
            outputs,
            waiter: Waiter::new(config.wait_timeout),
            cycle_budget: config.cycle_budget,
            state,
            report: RunReport::default(),
        })
    }

    /// Run one cycle of the loop.
    pub fn step(&mut self, cancel: &CancelToken) -> CycleOutcome {
        if self.state == LoopState::Done {
            return CycleOutcome::Done;
        }

        if cancel.is_cancelled() {
            info!("Cancellation requested, stopping");
            self.report.cancelled = true;
            self.state = LoopState::Done;
            return CycleOutcome::Cancelled;
        }

        self.state = LoopState::Waiting;
        self.report.wait_calls += 1;

        let outcome = match self.waiter.wait(&mut self.bus, self.subs.handles()) {
            WaitOutcome::Ready(ready) => {
                self.report.ready_wakeups += 1;
                self.state = LoopState::Dispatching;
                self.dispatch(&ready)
            }
            WaitOutcome::Timeout => {
                self.report.timeouts += 1;
                CycleOutcome::Timeout
            }
            WaitOutcome::Error(_) => CycleOutcome::WaitError,
        };

        self.report.wait_errors = self.waiter.error_count();
        self.report.logged_wait_errors = self.waiter.logged_error_count();
        self.report.cycles += 1;
        self.state = LoopState::Idle;

        if let Some(budget) = self.cycle_budget {
            if self.report.cycles >= budget {
                info!("Cycle budget of {} reached, stopping", budget);
                self.state = LoopState::Done;
            }
        }

        outcome
    }

    /// Run cycles until the budget is spent or `cancel` is set.
    pub fn run(&mut self, cancel: &CancelToken) -> &RunReport {
        while self.state != LoopState::Done {
            self.step(cancel);
        }
        &self.report
    }

    /// Release all subscriptions and hand back the bus and the final report.
    pub fn shutdown(mut self) -> (B, RunReport) {
        self.subs.unsubscribe_all(&mut self.bus);
        self.state = LoopState::Done;

        info!(
            "Node stopped after {} cycles ({} ready, {} timeouts, {} wait errors)",
            self.report.cycles,
            self.report.ready_wakeups,
            self.report.timeouts,
            self.report.wait_errors
        );

        (self.bus, self.report)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn observed(&self) -> &ObservedInputs {
        &self.observed
    }

    pub fn outputs(&self) -> &DerivedOutputs {
        &self.outputs
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn dispatch(&mut self, ready: &ReadySet) -> CycleOutcome {
        // Copy everything first so each handler sees all inputs of this wake-up
        let mut fresh: Vec<(usize, Msg)> = Vec::with_capacity(ready.len());

        for (i, sub) in self.subs.iter().enumerate() {
            if !ready.contains(i) {
                continue;
            }

            match self.bus.copy_latest(sub.handle) {
                Ok(Some(msg)) if msg.topic() == sub.topic => {
                    self.observed.record(msg.clone());
                    fresh.push((i, msg));
                }
                Ok(Some(msg)) => {
                    warn!("Copy of {} returned a {} message", sub.topic, msg.topic());
                    self.report.copy_errors += 1;
                }
                Ok(None) => {
                    warn!("{} was reported ready but had no data", sub.topic);
                    self.report.empty_copies += 1;
                }
                Err(e) => {
                    warn!("Could not copy {}: {}", sub.topic, e);
                    self.report.copy_errors += 1;
                }
            }
        }

        let mut handled = Vec::with_capacity(fresh.len());

        for (i, msg) in fresh.iter() {
            let topic = msg.topic();

            if let Err(e) = self.handlers[*i].handle(msg, &self.observed, &mut self.outputs) {
                warn!("Handler for {} failed: {}", topic, e);
                self.report.handler_errors += 1;
            }

            *self.report.dispatched.entry(topic.name().into()).or_insert(0) += 1;
            handled.push(topic);
        }

        let published = self.publish_dirty();

        CycleOutcome::Dispatched { handled, published }
    }

    fn publish_dirty(&mut self) -> Vec<TopicId> {
        let mut published = Vec::new();

        for record in self.outputs.dirty() {
            match self.bus.publish(record.publisher, &record.msg) {
                Ok(()) => {
                    trace!("Published {}", record.topic);
                    *self
                        .report
                        .published
                        .entry(record.topic.name().into())
                        .or_insert(0) += 1;
                    published.push(record.topic);
                }
                Err(e) => {
                    warn!("Could not publish {}: {}", record.topic, e);
                    self.report.publish_errors += 1;
                }
            }
        }

        self.outputs.clear_dirty();

        published
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock_bus::ScriptedBus;
    use comms_if::topic::{
        ActuatorOutputs, SensorCombined, VehicleAttitude, VehicleThrustSetpoint,
    };
    use std::{cell::RefCell, rc::Rc};

    const A: TopicId = TopicId::SensorCombined;
    const B: TopicId = TopicId::VehicleThrustSetpoint;
    const OUT: TopicId = TopicId::VehicleAttitude;

    fn sensor(t: u64) -> Msg {
        Msg::SensorCombined(SensorCombined {
            timestamp_us: t,
            accelerometer_m_s2: [0.0, 0.0, -9.81],
            gyro_rad: [0.0; 3],
        })
    }

    fn thrust(t: u64) -> Msg {
        Msg::VehicleThrustSetpoint(VehicleThrustSetpoint {
            timestamp_us: t,
            xyz: [0.0, 0.0, -0.5],
        })
    }

    fn act_outputs(t: u64) -> Msg {
        Msg::ActuatorOutputs(ActuatorOutputs {
            timestamp_us: t,
            ..Default::default()
        })
    }

    fn config(inputs: Vec<InputSpec>, outputs: Vec<TopicId>, budget: Option<u64>) -> NodeConfig {
        NodeConfig {
            inputs,
            outputs,
            wait_timeout: Duration::from_millis(10),
            cycle_budget: budget,
        }
    }

    fn noop(topic: TopicId) -> InputSpec {
        InputSpec::with_fn(topic, Duration::from_millis(0), |_, _, _| Ok(()))
    }

    /// Handler deriving `OUT` from the sum of the A and B timestamps, only once both are observed.
    fn needs_both(topic: TopicId) -> InputSpec {
        InputSpec::with_fn(topic, Duration::from_millis(0), |_, inputs, outputs| {
            match (inputs.get(A), inputs.get(B)) {
                (Some(a), Some(b)) => outputs.update(Msg::VehicleAttitude(VehicleAttitude {
                    timestamp_us: a.timestamp_us() + b.timestamp_us(),
                    q: [1.0, 0.0, 0.0, 0.0],
                })),
                _ => Ok(()),
            }
        })
    }

    #[test]
    fn test_two_topic_scenario() {
        let bus = ScriptedBus::new()
            .ready(&[0], vec![sensor(10)])
            .ready(&[0, 1], vec![sensor(20), thrust(5)])
            .timeouts(3);

        let mut node =
            Node::new(bus, config(vec![needs_both(A), needs_both(B)], vec![OUT], Some(5))).unwrap();
        let cancel = CancelToken::new();

        // Only A observed, nothing can be derived yet
        assert_eq!(
            node.step(&cancel),
            CycleOutcome::Dispatched {
                handled: vec![A],
                published: vec![]
            }
        );

        // Both handlers write the output, it goes out once
        assert_eq!(
            node.step(&cancel),
            CycleOutcome::Dispatched {
                handled: vec![A, B],
                published: vec![OUT]
            }
        );

        node.run(&cancel);
        assert_eq!(node.state(), LoopState::Done);

        let (bus, report) = node.shutdown();

        assert_eq!(report.dispatch_count(A), 2);
        assert_eq!(report.dispatch_count(B), 1);
        assert_eq!(report.timeouts, 3);
        assert_eq!(report.cycles, 5);
        assert_eq!(report.publish_count(OUT), 1);

        assert_eq!(bus.published.len(), 1);
        let (wait_call, msg) = &bus.published[0];
        assert_eq!(*wait_call, 2);
        assert_eq!(msg.timestamp_us(), 25);

        assert_eq!(bus.live_subs(), 0);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));

        let recorder = |topic: TopicId| {
            let order = order.clone();
            InputSpec::with_fn(topic, Duration::from_millis(0), move |msg, _, _| {
                order.borrow_mut().push(msg.topic());
                Ok(())
            })
        };

        let bus = ScriptedBus::new().ready(
            &[2, 0, 1, 7],
            vec![thrust(1), act_outputs(1), sensor(1)],
        );

        let inputs = vec![
            recorder(TopicId::ActuatorOutputs),
            recorder(TopicId::VehicleThrustSetpoint),
            recorder(TopicId::SensorCombined),
        ];
        let mut node = Node::new(bus, config(inputs, vec![], Some(1))).unwrap();
        node.run(&CancelToken::new());

        assert_eq!(
            *order.borrow(),
            vec![
                TopicId::ActuatorOutputs,
                TopicId::VehicleThrustSetpoint,
                TopicId::SensorCombined
            ]
        );
    }

    #[test]
    fn test_handlers_see_inputs_of_same_wakeup() {
        let seen_b = Rc::new(RefCell::new(false));
        let seen = seen_b.clone();

        // A runs first but B was copied before any handler ran
        let a = InputSpec::with_fn(A, Duration::from_millis(0), move |_, inputs, _| {
            *seen.borrow_mut() = inputs.has_observed(B);
            Ok(())
        });

        let bus = ScriptedBus::new().ready(&[0, 1], vec![sensor(1), thrust(1)]);
        let mut node = Node::new(bus, config(vec![a, noop(B)], vec![], Some(1))).unwrap();
        node.run(&CancelToken::new());

        assert!(*seen_b.borrow());
    }

    #[test]
    fn test_single_publish_of_combined_record() {
        // Each handler fills in its own part of the same output record
        let a = InputSpec::with_fn(A, Duration::from_millis(0), |msg, _, outputs| {
            let mut att = outputs
                .get(OUT)
                .and_then(Msg::as_vehicle_attitude)
                .cloned()
                .unwrap_or_default();
            att.q[1] = 1.0;
            att.timestamp_us = msg.timestamp_us();
            outputs.update(Msg::VehicleAttitude(att))
        });
        let b = InputSpec::with_fn(B, Duration::from_millis(0), |_, _, outputs| {
            let mut att = outputs
                .get(OUT)
                .and_then(Msg::as_vehicle_attitude)
                .cloned()
                .unwrap_or_default();
            att.q[2] = 2.0;
            outputs.update(Msg::VehicleAttitude(att))
        });

        let bus = ScriptedBus::new().ready(&[0, 1], vec![sensor(7), thrust(7)]);
        let mut node = Node::new(bus, config(vec![a, b], vec![OUT], Some(1))).unwrap();
        node.run(&CancelToken::new());

        let (bus, _) = node.shutdown();
        assert_eq!(bus.published.len(), 1);
        match &bus.published[0].1 {
            Msg::VehicleAttitude(att) => {
                assert_eq!(att.timestamp_us, 7);
                assert_eq!(att.q, [0.0, 1.0, 2.0, 0.0]);
            }
            m => panic!("Expected attitude, got {:?}", m),
        }
    }

    #[test]
    fn test_absent_input_is_not_zero() {
        // Only B arrives, A never does, so the derived output must never go out
        let bus = ScriptedBus::new()
            .ready(&[1], vec![thrust(1)])
            .ready(&[1], vec![thrust(2)]);

        let mut node =
            Node::new(bus, config(vec![needs_both(A), needs_both(B)], vec![OUT], Some(4))).unwrap();
        node.run(&CancelToken::new());

        assert!(!node.observed().has_observed(A));
        let (bus, report) = node.shutdown();
        assert!(bus.published.is_empty());
        assert_eq!(report.dispatch_count(B), 2);
    }

    #[test]
    fn test_wait_error_log_throttling() {
        let bus = ScriptedBus::new().errors(120);
        let mut node = Node::new(bus, config(vec![noop(A)], vec![], Some(120))).unwrap();
        let report = node.run(&CancelToken::new()).clone();

        assert_eq!(report.wait_errors, 120);
        assert_eq!(report.logged_wait_errors, 12);
        assert_eq!(report.cycles, 120);
    }

    #[test]
    fn test_timeouts_are_not_errors() {
        let bus = ScriptedBus::new().timeouts(2).errors(1).timeouts(2);
        let mut node = Node::new(bus, config(vec![noop(A)], vec![], None)).unwrap();
        let cancel = CancelToken::new();

        assert_eq!(node.step(&cancel), CycleOutcome::Timeout);
        assert_eq!(node.state(), LoopState::Idle);
        node.step(&cancel);
        assert_eq!(node.step(&cancel), CycleOutcome::WaitError);
        node.step(&cancel);
        node.step(&cancel);

        assert_eq!(node.report().timeouts, 4);
        assert_eq!(node.report().wait_errors, 1);
    }

    #[test]
    fn test_cycle_budget() {
        let mut node =
            Node::new(ScriptedBus::new(), config(vec![noop(A)], vec![], Some(5))).unwrap();
        let cancel = CancelToken::new();

        node.run(&cancel);
        assert_eq!(node.state(), LoopState::Done);
        assert_eq!(node.report().cycles, 5);
        assert_eq!(node.bus().wait_calls, 5);

        // Stepping a finished node does not wait again
        assert_eq!(node.step(&cancel), CycleOutcome::Done);
        assert_eq!(node.bus().wait_calls, 5);

        let node = Node::new(ScriptedBus::new(), config(vec![noop(A)], vec![], Some(0))).unwrap();
        assert_eq!(node.state(), LoopState::Done);
    }

    #[test]
    fn test_cancellation() {
        let mut node = Node::new(ScriptedBus::new(), config(vec![noop(A)], vec![], None)).unwrap();
        let cancel = CancelToken::new();

        node.step(&cancel);
        cancel.cancel();

        assert_eq!(node.step(&cancel), CycleOutcome::Cancelled);
        node.run(&cancel);

        assert_eq!(node.bus().wait_calls, 1);
        assert!(node.report().cancelled);
    }

    #[test]
    fn test_ready_without_data() {
        // A is reported ready but nothing has ever been published on it
        let bus = ScriptedBus::new().ready(&[0], vec![]);
        let mut node = Node::new(bus, config(vec![needs_both(A)], vec![OUT], Some(1))).unwrap();
        node.run(&CancelToken::new());

        assert_eq!(node.report().empty_copies, 1);
        assert_eq!(node.report().dispatch_count(A), 0);
    }

    #[test]
    fn test_ready_outside_handles_counts_as_timeout() {
        let bus = ScriptedBus::new().ready(&[4], vec![sensor(1)]);
        let mut node = Node::new(bus, config(vec![noop(A)], vec![], Some(1))).unwrap();

        assert_eq!(node.step(&CancelToken::new()), CycleOutcome::Timeout);
        assert_eq!(node.report().timeouts, 1);
        assert_eq!(node.report().ready_wakeups, 0);
        assert_eq!(node.report().dispatch_count(A), 0);
    }

    #[test]
    fn test_handler_and_publish_errors_are_not_fatal() {
        let failing = InputSpec::with_fn(A, Duration::from_millis(0), |_, _, outputs| {
            outputs.update(Msg::VehicleAttitude(VehicleAttitude::default()))?;
            outputs.update(Msg::zeroed(TopicId::ActuatorControls))
        });

        let mut bus = ScriptedBus::new()
            .ready(&[0], vec![sensor(1)])
            .ready(&[0], vec![sensor(2)]);
        bus.fail_publish = true;

        let mut node = Node::new(bus, config(vec![failing], vec![OUT], Some(2))).unwrap();
        node.run(&CancelToken::new());

        let report = node.report();
        assert_eq!(report.handler_errors, 2);
        assert_eq!(report.publish_errors, 2);
        assert_eq!(report.dispatch_count(A), 2);
        assert_eq!(report.cycles, 2);
    }

    #[test]
    fn test_startup_errors() {
        let mut bus = ScriptedBus::new();
        bus.unknown.push(B);

        let result = Node::new(bus, config(vec![noop(A), noop(B)], vec![], None));
        assert!(matches!(
            result,
            Err(NodeError::Subscribe(SubscribeError::Subscribe(
                TopicId::VehicleThrustSetpoint,
                BusError::UnknownTopic(_)
            )))
        ));

        assert!(matches!(
            Node::new(ScriptedBus::new(), config(vec![noop(A), noop(A)], vec![], None)),
            Err(NodeError::Subscribe(SubscribeError::Duplicate(_)))
        ));

        assert!(matches!(
            Node::new(ScriptedBus::new(), config(vec![noop(A)], vec![OUT, OUT], None)),
            Err(NodeError::DuplicateOutput(_))
        ));

        assert!(matches!(
            Node::new(ScriptedBus::new(), config(vec![], vec![], None)),
            Err(NodeError::NoInputs)
        ));
    }

    #[test]
    fn test_report_serialises() {
        let mut report = RunReport::default();
        report.dispatched.insert("sensor_combined".into(), 3);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dispatched"]["sensor_combined"], 3);
        assert_eq!(json["cancelled"], false);
    }
}
