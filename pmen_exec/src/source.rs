//! # Data sources
//!
//! Publisher threads feeding the node's input topics when it runs on a [`LocalBus`]. Either a
//! synthetic source driven by [`SimParams`], or a [`ReplayScript`].
//!
//! Topics are advertised lazily with their first real message, so the node never observes a
//! zeroed input the source did not mean to send.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{
    collections::HashMap,
    f64::consts::PI,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use comms_if::{
    bus::{Bus, BusError, LocalBus, PubHandle},
    topic::{
        ActuatorOutputs, Msg, SensorCombined, TopicId, VehicleThrustSetpoint,
    },
};
use util::replay::{PendingMsgs, ReplayScript};

use crate::{node::CancelToken, params::SimParams};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Standard gravity.
///
/// Units: meters/second^2
const GRAVITY_M_S2: f64 = 9.80665;

/// Sleep between two checks of the replay script.
const REPLAY_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Thrust demanded by the synthetic source once thrust has started.
const SIM_THRUST_XYZ: [f32; 3] = [0.0, 0.0, -0.5];

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub enum DataSource {
    Sim(SimParams),
    Replay(ReplayScript),
}

/// Publishes messages on a bus, advertising each topic on first use.
struct LazyPublisher {
    bus: LocalBus,
    pubs: HashMap<TopicId, PubHandle>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Simulation rate must be positive, found {0} Hz")]
    InvalidRate(f64),

    #[error("Could not start the source thread: {0}")]
    SpawnFailed(std::io::Error),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl LazyPublisher {
    fn new(bus: LocalBus) -> Self {
        Self {
            bus,
            pubs: HashMap::new(),
        }
    }

    fn publish(&mut self, msg: &Msg) -> Result<(), BusError> {
        let topic = msg.topic();

        match self.pubs.get(&topic) {
            Some(&handle) => self.bus.publish(handle, msg),
            None => {
                let handle = self.bus.advertise(topic, msg)?;
                debug!("Source advertised {}", topic);
                self.pubs.insert(topic, handle);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Start the source on its own thread. The thread stops once `cancel` is set, or at the end of
/// a replay script.
pub fn spawn(
    bus: LocalBus,
    source: DataSource,
    cancel: CancelToken,
) -> Result<JoinHandle<()>, SourceError> {
    let publisher = LazyPublisher::new(bus);

    match source {
        DataSource::Sim(params) => {
            if !(params.rate_hz > 0.0) {
                return Err(SourceError::InvalidRate(params.rate_hz));
            }

            thread::Builder::new()
                .name("sim_source".into())
                .spawn(move || run_sim(publisher, params, cancel))
                .map_err(SourceError::SpawnFailed)
        }
        DataSource::Replay(script) => thread::Builder::new()
            .name("replay_source".into())
            .spawn(move || run_replay(publisher, script, cancel))
            .map_err(SourceError::SpawnFailed),
    }
}

/// Messages published by the synthetic source `elapsed_s` seconds into the run.
///
/// The vehicle rolls sinusoidally about its x axis. Thrust setpoints only appear after
/// `thrust_start_s`.
pub fn sim_msgs(params: &SimParams, elapsed_s: f64) -> Vec<Msg> {
    let timestamp_us = (elapsed_s * 1e6) as u64;

    let omega = 2.0 * PI / params.roll_period_s;
    let roll = params.roll_amplitude_rad * (omega * elapsed_s).sin();
    let roll_rate = params.roll_amplitude_rad * omega * (omega * elapsed_s).cos();

    let mut msgs = vec![
        Msg::SensorCombined(SensorCombined {
            timestamp_us,
            accelerometer_m_s2: [
                0.0,
                (-GRAVITY_M_S2 * roll.sin()) as f32,
                (-GRAVITY_M_S2 * roll.cos()) as f32,
            ],
            gyro_rad: [roll_rate as f32, 0.0, 0.0],
        }),
    ];

    let mut outputs = ActuatorOutputs {
        timestamp_us,
        noutputs: 4,
        ..Default::default()
    };
    for (i, o) in outputs.output.iter_mut().take(4).enumerate() {
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        *o = (1500.0 + sign * 200.0 * roll / params.roll_amplitude_rad.max(1e-6)) as f32;
    }
    msgs.push(Msg::ActuatorOutputs(outputs));

    if elapsed_s >= params.thrust_start_s {
        msgs.push(Msg::VehicleThrustSetpoint(VehicleThrustSetpoint {
            timestamp_us,
            xyz: SIM_THRUST_XYZ,
        }));
    }

    msgs
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn run_sim(mut publisher: LazyPublisher, params: SimParams, cancel: CancelToken) {
    let period = Duration::from_secs_f64(1.0 / params.rate_hz);
    let start = Instant::now();

    info!("Simulated source running at {} Hz", params.rate_hz);

    while !cancel.is_cancelled() {
        for msg in sim_msgs(&params, start.elapsed().as_secs_f64()) {
            if let Err(e) = publisher.publish(&msg) {
                warn!("Simulated source could not publish {}: {}", msg.topic(), e);
            }
        }

        thread::sleep(period);
    }

    debug!("Simulated source stopped");
}

fn run_replay(mut publisher: LazyPublisher, mut script: ReplayScript, cancel: CancelToken) {
    info!(
        "Replaying {} messages from {:?} over {:.02} s",
        script.num_msgs(),
        script.path(),
        script.duration_s()
    );

    while !cancel.is_cancelled() {
        match script.pending() {
            PendingMsgs::None => thread::sleep(REPLAY_POLL_PERIOD),
            PendingMsgs::Some(msgs) => {
                for msg in msgs.iter() {
                    if let Err(e) = publisher.publish(msg) {
                        warn!("Replay could not publish {}: {}", msg.topic(), e);
                    }
                }
            }
            PendingMsgs::EndOfScript => {
                info!("End of replay script reached");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
