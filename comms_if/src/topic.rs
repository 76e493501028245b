//! # Topic Definitions
//!
//! This module defines the topics carried by the bus and the message record published on each of
//! them. Every topic carries exactly one message type, so a [`Msg`] always knows which topic it
//! belongs to.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum number of output channels in an [`ActuatorOutputs`] message.
pub const NUM_ACTUATOR_OUTPUTS: usize = 16;

/// Number of channels in an [`ActuatorControls`] message.
pub const NUM_ACTUATOR_CONTROLS: usize = 8;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

/// Generate the typed accessors on `Msg`, one per variant.
macro_rules! msg_accessors {
    ($(($fn_name:ident, $variant:ident)),+) => {
        $(
            #[doc = concat!("Borrow the inner record if this is a `", stringify!($variant), "`.")]
            pub fn $fn_name(&self) -> Option<&$variant> {
                match self {
                    Msg::$variant(m) => Some(m),
                    _ => None
                }
            }
        )+
    };
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Identifier of a topic on the bus.
#[derive(Serialize, Deserialize, Debug, Hash, Eq, PartialEq, Copy, Clone, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TopicId {
    SensorCombined,
    ActuatorOutputs,
    VehicleThrustSetpoint,
    VehicleAttitude,
    ActuatorControls,
}

/// A message on the bus, tagged by its topic.
///
/// Serialised as `{"topic": "<topic name>", "data": {...}}`, which is the format used both on the
/// network and in replay scripts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "topic", content = "data", rename_all = "snake_case")]
pub enum Msg {
    SensorCombined(SensorCombined),
    ActuatorOutputs(ActuatorOutputs),
    VehicleThrustSetpoint(VehicleThrustSetpoint),
    VehicleAttitude(VehicleAttitude),
    ActuatorControls(ActuatorControls),
}

/// Error returned when parsing an unknown topic name.
#[derive(Debug, thiserror::Error)]
#[error("Unknown topic name \"{0}\"")]
pub struct UnknownTopicName(pub String);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Combined raw IMU sample.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorCombined {
    /// Sample time in microseconds since the publisher's epoch.
    pub timestamp_us: u64,

    /// Specific force along the body axes.
    ///
    /// Units: meters/second^2
    pub accelerometer_m_s2: [f32; 3],

    /// Angular rate about the body axes.
    ///
    /// Units: radians/second
    pub gyro_rad: [f32; 3],
}

/// Mixer outputs as sent to the actuators.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorOutputs {
    pub timestamp_us: u64,

    /// Number of valid entries at the start of `output`.
    pub noutputs: u32,

    pub output: [f32; NUM_ACTUATOR_OUTPUTS],
}

/// Demanded thrust vector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleThrustSetpoint {
    pub timestamp_us: u64,

    /// Normalised thrust demand in the local level frame, each axis nominally in `[-1, 1]`.
    pub xyz: [f32; 3],
}

/// Vehicle attitude.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct VehicleAttitude {
    pub timestamp_us: u64,

    /// Rotation from body to local level frame as a `[w, x, y, z]` quaternion.
    ///
    /// An all-zero quaternion means no attitude has been derived yet.
    pub q: [f32; 4],
}

/// Normalised control demands for the mixer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ActuatorControls {
    pub timestamp_us: u64,

    /// Channels 0-2 hold the body frame thrust, channel 3 the thrust magnitude. Remaining
    /// channels are unused and stay at zero.
    pub control: [f32; NUM_ACTUATOR_CONTROLS],
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TopicId {
    /// Every topic known to the software.
    pub const ALL: [TopicId; 5] = [
        TopicId::SensorCombined,
        TopicId::ActuatorOutputs,
        TopicId::VehicleThrustSetpoint,
        TopicId::VehicleAttitude,
        TopicId::ActuatorControls,
    ];

    /// The name of the topic as used in parameter files and on the network.
    pub fn name(&self) -> &'static str {
        match self {
            TopicId::SensorCombined => "sensor_combined",
            TopicId::ActuatorOutputs => "actuator_outputs",
            TopicId::VehicleThrustSetpoint => "vehicle_thrust_setpoint",
            TopicId::VehicleAttitude => "vehicle_attitude",
            TopicId::ActuatorControls => "actuator_controls",
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TopicId {
    type Err = UnknownTopicName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicId::ALL
            .iter()
            .find(|t| t.name() == s)
            .copied()
            .ok_or_else(|| UnknownTopicName(s.to_string()))
    }
}

impl Msg {
    /// The topic this message is published on.
    pub fn topic(&self) -> TopicId {
        match self {
            Msg::SensorCombined(_) => TopicId::SensorCombined,
            Msg::ActuatorOutputs(_) => TopicId::ActuatorOutputs,
            Msg::VehicleThrustSetpoint(_) => TopicId::VehicleThrustSetpoint,
            Msg::VehicleAttitude(_) => TopicId::VehicleAttitude,
            Msg::ActuatorControls(_) => TopicId::ActuatorControls,
        }
    }

    /// A zero-initialised message for the given topic.
    pub fn zeroed(topic: TopicId) -> Self {
        match topic {
            TopicId::SensorCombined => Msg::SensorCombined(Default::default()),
            TopicId::ActuatorOutputs => Msg::ActuatorOutputs(Default::default()),
            TopicId::VehicleThrustSetpoint => Msg::VehicleThrustSetpoint(Default::default()),
            TopicId::VehicleAttitude => Msg::VehicleAttitude(Default::default()),
            TopicId::ActuatorControls => Msg::ActuatorControls(Default::default()),
        }
    }

    /// Timestamp of the inner record in microseconds.
    pub fn timestamp_us(&self) -> u64 {
        match self {
            Msg::SensorCombined(m) => m.timestamp_us,
            Msg::ActuatorOutputs(m) => m.timestamp_us,
            Msg::VehicleThrustSetpoint(m) => m.timestamp_us,
            Msg::VehicleAttitude(m) => m.timestamp_us,
            Msg::ActuatorControls(m) => m.timestamp_us,
        }
    }

    msg_accessors!(
        (as_sensor_combined, SensorCombined),
        (as_actuator_outputs, ActuatorOutputs),
        (as_vehicle_thrust_setpoint, VehicleThrustSetpoint),
        (as_vehicle_attitude, VehicleAttitude),
        (as_actuator_controls, ActuatorControls)
    );

    /// Parse a message from its JSON representation.
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
