//! Scripted bus used by the node tests.
//!
//! Each wait pops the next scripted step, makes its messages the latest copy of their topics and
//! returns its outcome. Once the script runs out every wait times out.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use comms_if::{
    bus::{Bus, BusError, PubHandle, ReadySet, SubHandle, WaitError, WaitOutcome},
    topic::{Msg, TopicId},
};

pub struct Step {
    outcome: WaitOutcome,
    msgs: Vec<Msg>,
}

#[derive(Default)]
pub struct ScriptedBus {
    script: VecDeque<Step>,
    latest: HashMap<TopicId, Msg>,

    /// Topics the bus refuses to subscribe to
    pub unknown: Vec<TopicId>,

    /// Subscriptions as (topic, interval, live)
    pub subs: Vec<(TopicId, Duration, bool)>,
    pub pubs: Vec<TopicId>,

    /// Published messages with the number of the wait call they followed
    pub published: Vec<(usize, Msg)>,
    pub wait_calls: usize,
    pub fail_publish: bool,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(mut self, indices: &[usize], msgs: Vec<Msg>) -> Self {
        self.script.push_back(Step {
            outcome: WaitOutcome::Ready(indices.iter().copied().collect::<ReadySet>()),
            msgs,
        });
        self
    }

    pub fn timeouts(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.script.push_back(Step {
                outcome: WaitOutcome::Timeout,
                msgs: vec![],
            });
        }
        self
    }

    pub fn errors(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.script.push_back(Step {
                outcome: WaitOutcome::Error(WaitError::Poll(-4)),
                msgs: vec![],
            });
        }
        self
    }

    pub fn published_topics(&self) -> Vec<TopicId> {
        self.published.iter().map(|(_, m)| m.topic()).collect()
    }

    pub fn live_subs(&self) -> usize {
        self.subs.iter().filter(|s| s.2).count()
    }
}

impl Bus for ScriptedBus {
    fn subscribe(&mut self, topic: TopicId) -> Result<SubHandle, BusError> {
        if self.unknown.contains(&topic) {
            return Err(BusError::UnknownTopic(topic));
        }
        self.subs.push((topic, Duration::from_millis(0), true));
        Ok(SubHandle::from_raw(self.subs.len() - 1))
    }

    fn set_interval(&mut self, handle: SubHandle, period: Duration) -> Result<(), BusError> {
        match self.subs.get_mut(handle.index()) {
            Some(s) if s.2 => {
                s.1 = period;
                Ok(())
            }
            _ => Err(BusError::InvalidSubHandle(handle)),
        }
    }

    fn unsubscribe(&mut self, handle: SubHandle) -> Result<(), BusError> {
        match self.subs.get_mut(handle.index()) {
            Some(s) if s.2 => {
                s.2 = false;
                Ok(())
            }
            _ => Err(BusError::InvalidSubHandle(handle)),
        }
    }

    fn advertise(&mut self, topic: TopicId, _initial: &Msg) -> Result<PubHandle, BusError> {
        self.pubs.push(topic);
        Ok(PubHandle::from_raw(self.pubs.len() - 1))
    }

    fn publish(&mut self, publisher: PubHandle, msg: &Msg) -> Result<(), BusError> {
        if self.fail_publish {
            return Err(BusError::Network("scripted failure".into()));
        }
        match self.pubs.get(publisher.index()) {
            Some(&topic) if topic == msg.topic() => {
                self.published.push((self.wait_calls, msg.clone()));
                Ok(())
            }
            Some(&topic) => Err(BusError::TopicMismatch {
                expected: topic,
                found: msg.topic(),
            }),
            None => Err(BusError::InvalidPubHandle(publisher)),
        }
    }

    fn wait(&mut self, _handles: &[SubHandle], _timeout: Duration) -> WaitOutcome {
        self.wait_calls += 1;

        match self.script.pop_front() {
            Some(step) => {
                for msg in step.msgs {
                    self.latest.insert(msg.topic(), msg);
                }
                step.outcome
            }
            None => WaitOutcome::Timeout,
        }
    }

    fn copy_latest(&mut self, handle: SubHandle) -> Result<Option<Msg>, BusError> {
        match self.subs.get(handle.index()) {
            Some(&(topic, _, true)) => Ok(self.latest.get(&topic).cloned()),
            _ => Err(BusError::InvalidSubHandle(handle)),
        }
    }
}
