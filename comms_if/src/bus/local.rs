//! # Local Bus
//!
//! In-process bus keeping the latest message of every topic. Each publish bumps the topic's
//! generation counter and wakes any waiting subscriber, and a handle is ready when its topic's
//! generation is newer than the one it last copied and its delivery interval has elapsed.
//!
//! The bus is cheap to clone, every clone shares the same registry, so publisher threads simply
//! take their own clone.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::trace;
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use super::{Bus, BusError, PubHandle, ReadySet, SubHandle, WaitError, WaitOutcome};
use crate::topic::{Msg, TopicId};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Shared in-process bus.
#[derive(Clone)]
pub struct LocalBus {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    published: Condvar,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<TopicId, TopicSlot>,

    /// Subscriptions indexed by handle, `None` once unsubscribed.
    subs: Vec<Option<SubState>>,

    /// Topic of each advertised publisher, indexed by handle.
    pubs: Vec<TopicId>,
}

#[derive(Default)]
struct TopicSlot {
    latest: Option<Msg>,
    generation: u64,
}

struct SubState {
    topic: TopicId,
    last_generation: u64,
    interval: Duration,
    last_copy: Option<Instant>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl LocalBus {
    /// Create a bus carrying every topic in [`TopicId::ALL`].
    pub fn new() -> Self {
        Self::with_topics(&TopicId::ALL)
    }

    /// Create a bus carrying only the given topics.
    pub fn with_topics(topics: &[TopicId]) -> Self {
        let registry = Registry {
            topics: topics.iter().map(|t| (*t, TopicSlot::default())).collect(),
            ..Default::default()
        };

        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(registry),
                published: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>, BusError> {
        self.shared.registry.lock().map_err(|_| BusError::Poisoned)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    fn sub_mut(&mut self, handle: SubHandle) -> Result<&mut SubState, BusError> {
        self.subs
            .get_mut(handle.0)
            .and_then(|s| s.as_mut())
            .ok_or(BusError::InvalidSubHandle(handle))
    }

    /// Work out which handles are ready now.
    ///
    /// Returns the ready set and, if some handle has unread data but is held back by its
    /// interval, the earliest instant at which one of them becomes deliverable.
    fn poll(
        &self,
        handles: &[SubHandle],
        now: Instant,
    ) -> Result<(ReadySet, Option<Instant>), WaitError> {
        let mut ready = ReadySet::new();
        let mut next_eligible: Option<Instant> = None;

        for (i, handle) in handles.iter().enumerate() {
            let sub = match self.subs.get(handle.0).and_then(|s| s.as_ref()) {
                Some(s) => s,
                None => return Err(WaitError::InvalidHandle(*handle)),
            };

            let generation = self
                .topics
                .get(&sub.topic)
                .map(|t| t.generation)
                .unwrap_or(0);

            if generation <= sub.last_generation {
                continue;
            }

            let eligible_at = match sub.last_copy {
                Some(t) => t + sub.interval,
                None => now,
            };

            if eligible_at <= now {
                ready.insert(i);
            } else {
                next_eligible = Some(match next_eligible {
                    Some(n) if n < eligible_at => n,
                    _ => eligible_at,
                });
            }
        }

        Ok((ready, next_eligible))
    }
}

impl Bus for LocalBus {
    fn subscribe(&mut self, topic: TopicId) -> Result<SubHandle, BusError> {
        let mut reg = self.lock()?;

        if !reg.topics.contains_key(&topic) {
            return Err(BusError::UnknownTopic(topic));
        }

        reg.subs.push(Some(SubState {
            topic,
            last_generation: 0,
            interval: Duration::from_millis(0),
            last_copy: None,
        }));

        let handle = SubHandle(reg.subs.len() - 1);
        trace!("Subscribed to {} as {}", topic, handle);

        Ok(handle)
    }

    fn set_interval(&mut self, handle: SubHandle, period: Duration) -> Result<(), BusError> {
        let mut reg = self.lock()?;
        reg.sub_mut(handle)?.interval = period;
        Ok(())
    }

    fn unsubscribe(&mut self, handle: SubHandle) -> Result<(), BusError> {
        let mut reg = self.lock()?;

        match reg.subs.get_mut(handle.0) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(BusError::InvalidSubHandle(handle)),
        }
    }

    fn advertise(&mut self, topic: TopicId, initial: &Msg) -> Result<PubHandle, BusError> {
        let handle = {
            let mut reg = self.lock()?;

            if !reg.topics.contains_key(&topic) {
                return Err(BusError::UnknownTopic(topic));
            }

            reg.pubs.push(topic);
            PubHandle(reg.pubs.len() - 1)
        };

        self.publish(handle, initial)?;

        Ok(handle)
    }

    fn publish(&mut self, publisher: PubHandle, msg: &Msg) -> Result<(), BusError> {
        let mut reg = self.lock()?;

        let topic = *reg
            .pubs
            .get(publisher.0)
            .ok_or(BusError::InvalidPubHandle(publisher))?;

        if msg.topic() != topic {
            return Err(BusError::TopicMismatch {
                expected: topic,
                found: msg.topic(),
            });
        }

        let slot = reg
            .topics
            .get_mut(&topic)
            .ok_or(BusError::UnknownTopic(topic))?;
        slot.latest = Some(msg.clone());
        slot.generation += 1;

        drop(reg);
        self.shared.published.notify_all();

        Ok(())
    }

    fn wait(&mut self, handles: &[SubHandle], timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;

        let mut reg = match self.shared.registry.lock() {
            Ok(r) => r,
            Err(_) => return WaitOutcome::Error(WaitError::Poisoned),
        };

        loop {
            let now = Instant::now();

            let (ready, next_eligible) = match reg.poll(handles, now) {
                Ok(r) => r,
                Err(e) => return WaitOutcome::Error(e),
            };

            if !ready.is_empty() {
                return WaitOutcome::Ready(ready);
            }

            if now >= deadline {
                return WaitOutcome::Timeout;
            }

            // Sleep until either the deadline or the moment a rate limited handle becomes
            // deliverable, whichever is first. Publishes wake us early.
            let wake_at = match next_eligible {
                Some(t) if t < deadline => t,
                _ => deadline,
            };

            reg = match self
                .shared
                .published
                .wait_timeout(reg, wake_at.saturating_duration_since(now))
            {
                Ok((r, _)) => r,
                Err(_) => return WaitOutcome::Error(WaitError::Poisoned),
            };
        }
    }

    fn copy_latest(&mut self, handle: SubHandle) -> Result<Option<Msg>, BusError> {
        let mut reg = self.lock()?;

        let topic = reg.sub_mut(handle)?.topic;
        let (latest, generation) = match reg.topics.get(&topic) {
            Some(slot) => (slot.latest.clone(), slot.generation),
            None => return Err(BusError::UnknownTopic(topic)),
        };

        let sub = reg.sub_mut(handle)?;
        sub.last_generation = generation;
        sub.last_copy = Some(Instant::now());

        Ok(latest)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
