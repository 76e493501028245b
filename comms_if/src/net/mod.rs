//! # Network Module
//!
//! A [`Bus`] implementation over ZMQ, the networking library chosen for the software. Every topic
//! has its own endpoint: publishers bind a PUB socket to it and each subscription connects its own
//! SUB socket. Messages travel as JSON, the same encoding used by replay scripts.
//!
//! SUB sockets are conflated so that only the latest message of a topic is ever queued, which
//! gives the same latest-value semantics as the local bus.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, trace};
use serde::Deserialize;
use std::{
    collections::HashMap,
    convert::TryFrom,
    time::{Duration, Instant},
};
use zmq::{Context, Socket, SocketType};

use crate::{
    bus::{Bus, BusError, PubHandle, ReadySet, SubHandle, WaitError, WaitOutcome},
    topic::{Msg, TopicId},
};

// Export zmq
pub use zmq;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

macro_rules! set_sockopts {
    ($socket:expr, $(($opt:ident, $val:expr)),+) => {
        $(
            $socket.$opt($val)
                .map_err(|e| BusError::Network(
                    format!("Could not set the {} socket option: {}", stringify!($opt), e)
                ))?;
        )+
    };
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Network parameters, loaded from `net.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetParams {
    /// Endpoints keyed by topic name, e.g. `sensor_combined`.
    pub endpoints: HashMap<String, TopicEndpoint>,

    /// `ZMQ_LINGER` for all sockets, in milliseconds.
    #[serde(default)]
    pub linger_ms: i32,
}

/// Where a topic lives on the network.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicEndpoint {
    /// Endpoint publishers bind to, such as `"tcp://*:5010"`.
    pub bind: String,

    /// Endpoint subscribers connect to, such as `"tcp://localhost:5010"`.
    pub connect: String,
}

/// Networked bus.
pub struct ZmqBus {
    ctx: Context,
    params: NetParams,

    subs: Vec<Option<ZmqSub>>,

    /// Topic of each publisher handle.
    pubs: Vec<TopicId>,

    /// One bound PUB socket per advertised topic, shared by all its publisher handles.
    pub_sockets: HashMap<TopicId, Socket>,
}

struct ZmqSub {
    topic: TopicId,
    socket: Socket,
    interval: Duration,
    last_copy: Option<Instant>,
    latest: Option<Msg>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl NetParams {
    /// Get the endpoint of a topic, if the network carries it.
    pub fn endpoint(&self, topic: TopicId) -> Option<&TopicEndpoint> {
        self.endpoints.get(topic.name())
    }
}

impl ZmqBus {
    /// Create a new networked bus with its own zmq context.
    pub fn new(params: NetParams) -> Self {
        Self::with_context(Context::new(), params)
    }

    /// Create a new networked bus using an existing context.
    ///
    /// `inproc://` endpoints only work between sockets of the same context.
    pub fn with_context(ctx: Context, params: NetParams) -> Self {
        Self {
            ctx,
            params,
            subs: Vec::new(),
            pubs: Vec::new(),
            pub_sockets: HashMap::new(),
        }
    }

    fn socket(&self, socket_type: SocketType) -> Result<Socket, BusError> {
        let socket = self
            .ctx
            .socket(socket_type)
            .map_err(|e| BusError::Network(format!("Error creating the socket: {}", e)))?;

        set_sockopts!(socket, (set_linger, self.params.linger_ms));

        Ok(socket)
    }

    fn sub(&self, handle: SubHandle) -> Result<&ZmqSub, BusError> {
        self.subs
            .get(handle.0)
            .and_then(|s| s.as_ref())
            .ok_or(BusError::InvalidSubHandle(handle))
    }

    fn sub_mut(&mut self, handle: SubHandle) -> Result<&mut ZmqSub, BusError> {
        self.subs
            .get_mut(handle.0)
            .and_then(|s| s.as_mut())
            .ok_or(BusError::InvalidSubHandle(handle))
    }
}

impl ZmqSub {
    /// Receive everything queued on the socket, keeping the newest message.
    fn drain(&mut self) -> Result<(), BusError> {
        loop {
            match self.socket.recv_bytes(zmq::DONTWAIT) {
                Ok(bytes) => {
                    let msg: Msg = serde_json::from_slice(&bytes)?;

                    if msg.topic() != self.topic {
                        return Err(BusError::TopicMismatch {
                            expected: self.topic,
                            found: msg.topic(),
                        });
                    }

                    self.latest = Some(msg);
                }
                Err(zmq::Error::EAGAIN) => return Ok(()),
                Err(e) => {
                    return Err(BusError::Network(format!(
                        "Could not receive a {} message: {}",
                        self.topic, e
                    )))
                }
            }
        }
    }
}

impl Bus for ZmqBus {
    fn subscribe(&mut self, topic: TopicId) -> Result<SubHandle, BusError> {
        let endpoint = self
            .params
            .endpoint(topic)
            .ok_or(BusError::UnknownTopic(topic))?
            .connect
            .clone();

        let socket = self.socket(zmq::SUB)?;
        set_sockopts!(socket, (set_conflate, true), (set_subscribe, b""));

        socket.connect(&endpoint).map_err(|e| {
            BusError::Network(format!("Could not connect to {}: {}", endpoint, e))
        })?;

        debug!("{} subscriber connected to {}", topic, endpoint);

        self.subs.push(Some(ZmqSub {
            topic,
            socket,
            interval: Duration::from_millis(0),
            last_copy: None,
            latest: None,
        }));

        Ok(SubHandle(self.subs.len() - 1))
    }

    fn set_interval(&mut self, handle: SubHandle, period: Duration) -> Result<(), BusError> {
        self.sub_mut(handle)?.interval = period;
        Ok(())
    }

    fn unsubscribe(&mut self, handle: SubHandle) -> Result<(), BusError> {
        match self.subs.get_mut(handle.0) {
            // Dropping the socket closes it
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(BusError::InvalidSubHandle(handle)),
        }
    }

    fn advertise(&mut self, topic: TopicId, initial: &Msg) -> Result<PubHandle, BusError> {
        if !self.pub_sockets.contains_key(&topic) {
            let endpoint = self
                .params
                .endpoint(topic)
                .ok_or(BusError::UnknownTopic(topic))?
                .bind
                .clone();

            let socket = self.socket(zmq::PUB)?;
            socket.bind(&endpoint).map_err(|e| {
                BusError::Network(format!("Could not bind to {}: {}", endpoint, e))
            })?;

            debug!("{} publisher bound to {}", topic, endpoint);

            self.pub_sockets.insert(topic, socket);
        }

        self.pubs.push(topic);
        let handle = PubHandle(self.pubs.len() - 1);

        self.publish(handle, initial)?;

        Ok(handle)
    }

    fn publish(&mut self, publisher: PubHandle, msg: &Msg) -> Result<(), BusError> {
        let topic = *self
            .pubs
            .get(publisher.0)
            .ok_or(BusError::InvalidPubHandle(publisher))?;

        if msg.topic() != topic {
            return Err(BusError::TopicMismatch {
                expected: topic,
                found: msg.topic(),
            });
        }

        let socket = self
            .pub_sockets
            .get(&topic)
            .ok_or(BusError::InvalidPubHandle(publisher))?;

        let msg_str = serde_json::to_string(msg)?;

        socket
            .send(msg_str.as_str(), 0)
            .map_err(|e| BusError::Network(format!("Could not send a {} message: {}", topic, e)))
    }

    fn wait(&mut self, handles: &[SubHandle], timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;

        for handle in handles {
            if self.sub(*handle).is_err() {
                return WaitOutcome::Error(WaitError::InvalidHandle(*handle));
            }
        }

        loop {
            let now = Instant::now();

            // Handles held back by their interval are left out of the poll
            let mut polled: Vec<usize> = Vec::with_capacity(handles.len());
            let mut next_eligible: Option<Instant> = None;

            for (i, handle) in handles.iter().enumerate() {
                let sub = match self.sub(*handle) {
                    Ok(s) => s,
                    Err(_) => return WaitOutcome::Error(WaitError::InvalidHandle(*handle)),
                };

                match sub.last_copy.map(|t| t + sub.interval) {
                    Some(t) if t > now => {
                        next_eligible = Some(match next_eligible {
                            Some(n) if n < t => n,
                            _ => t,
                        })
                    }
                    _ => polled.push(i),
                }
            }

            let wake_at = match next_eligible {
                Some(t) if t < deadline => t,
                _ => deadline,
            };
            let poll_ms = i64::try_from(wake_at.saturating_duration_since(now).as_millis())
                .unwrap_or(i64::MAX);

            let mut ready = ReadySet::new();
            {
                let mut items: Vec<zmq::PollItem> = Vec::with_capacity(polled.len());
                for &i in polled.iter() {
                    match self.sub(handles[i]) {
                        Ok(s) => items.push(s.socket.as_poll_item(zmq::POLLIN)),
                        Err(_) => return WaitOutcome::Error(WaitError::InvalidHandle(handles[i])),
                    }
                }

                if let Err(e) = zmq::poll(&mut items, poll_ms) {
                    return poll_error_outcome(e);
                }

                for (item, &i) in items.iter().zip(polled.iter()) {
                    if item.is_readable() {
                        ready.insert(i);
                    }
                }
            }

            if !ready.is_empty() {
                trace!("{} of {} handles ready", ready.len(), handles.len());
                return WaitOutcome::Ready(ready);
            }

            if Instant::now() >= deadline {
                return WaitOutcome::Timeout;
            }
        }
    }

    fn copy_latest(&mut self, handle: SubHandle) -> Result<Option<Msg>, BusError> {
        let sub = self.sub_mut(handle)?;

        sub.drain()?;
        sub.last_copy = Some(Instant::now());

        Ok(sub.latest.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Outcome of a wait whose poll failed.
///
/// A poll interrupted by a signal, such as Ctrl-C, returns early without data rather than failing.
fn poll_error_outcome(e: zmq::Error) -> WaitOutcome {
    match e {
        zmq::Error::EINTR => {
            debug!("Poll interrupted by a signal");
            WaitOutcome::Timeout
        }
        e => WaitOutcome::Error(WaitError::Poll(-e.to_raw())),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::topic::SensorCombined;

    fn inproc_params(topics: &[(TopicId, &str)]) -> NetParams {
        NetParams {
            endpoints: topics
                .iter()
                .map(|(t, ep)| {
                    (
                        t.name().to_string(),
                        TopicEndpoint {
                            bind: ep.to_string(),
                            connect: ep.to_string(),
                        },
                    )
                })
                .collect(),
            linger_ms: 0,
        }
    }

    #[test]
    fn test_params_from_toml() {
        let params: NetParams = toml::from_str(
            r#"
            linger_ms = 10

            [endpoints.sensor_combined]
            bind = "tcp://*:5010"
            connect = "tcp://localhost:5010"
            "#,
        )
        .unwrap();

        assert_eq!(
            params.endpoint(TopicId::SensorCombined).unwrap().connect,
            "tcp://localhost:5010"
        );
        assert!(params.endpoint(TopicId::VehicleAttitude).is_none());
    }

    #[test]
    fn test_unknown_topic() {
        let mut bus = ZmqBus::new(inproc_params(&[]));
        assert!(matches!(
            bus.subscribe(TopicId::SensorCombined),
            Err(BusError::UnknownTopic(TopicId::SensorCombined))
        ));
    }

    #[test]
    fn test_pub_sub_round_trip() -> Result<(), BusError> {
        let mut bus = ZmqBus::new(inproc_params(&[(
            TopicId::SensorCombined,
            "inproc://test_pub_sub_round_trip",
        )]));

        let publisher =
            bus.advertise(TopicId::SensorCombined, &Msg::zeroed(TopicId::SensorCombined))?;
        let sub = bus.subscribe(TopicId::SensorCombined)?;

        let msg = Msg::SensorCombined(SensorCombined {
            timestamp_us: 42,
            accelerometer_m_s2: [0.1, 0.2, -9.8],
            gyro_rad: [0.0; 3],
        });

        // The subscription takes a moment to reach the publisher, so keep publishing until the
        // subscriber sees something.
        let mut got_ready = false;
        for _ in 0..100 {
            bus.publish(publisher, &msg)?;
            if let WaitOutcome::Ready(set) = bus.wait(&[sub], Duration::from_millis(20)) {
                assert!(set.contains(0));
                got_ready = true;
                break;
            }
        }
        assert!(got_ready);

        assert_eq!(bus.copy_latest(sub)?, Some(msg));

        Ok(())
    }

    #[test]
    fn test_interrupted_poll_is_not_an_error() {
        assert_eq!(poll_error_outcome(zmq::Error::EINTR), WaitOutcome::Timeout);
        assert_eq!(
            poll_error_outcome(zmq::Error::ETERM),
            WaitOutcome::Error(WaitError::Poll(-zmq::Error::ETERM.to_raw()))
        );
    }

    #[test]
    fn test_silent_topic_times_out() -> Result<(), BusError> {
        let mut bus = ZmqBus::new(inproc_params(&[(
            TopicId::VehicleAttitude,
            "inproc://test_silent_topic_times_out",
        )]));

        let sub = bus.subscribe(TopicId::VehicleAttitude)?;
        assert_eq!(
            bus.wait(&[sub], Duration::from_millis(30)),
            WaitOutcome::Timeout
        );
        assert_eq!(bus.copy_latest(sub)?, None);

        Ok(())
    }
}
