//! # PMEN handlers
//!
//! The handler table of the node:
//!
//! | Input                     | Derives                                   |
//! |---------------------------|-------------------------------------------|
//! | `sensor_combined`         | `vehicle_attitude`, `actuator_controls`*  |
//! | `vehicle_thrust_setpoint` | `actuator_controls`*                      |
//! | `actuator_outputs`        | nothing, logged only                      |
//!
//! \* only once both a sensor sample and a thrust setpoint have been observed.
//!
//! Attitude is the roll/pitch tilt implied by the accelerometer, with yaw fixed at zero.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use comms_if::topic::{
    ActuatorControls, Msg, SensorCombined, TopicId, VehicleAttitude, VehicleThrustSetpoint,
};

use crate::dispatch::{expect_msg, DerivedOutputs, HandlerError, ObservedInputs, TopicHandler};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Outputs of the node in publish order.
pub const OUTPUTS: [TopicId; 2] = [TopicId::VehicleAttitude, TopicId::ActuatorControls];

/// Below this specific force magnitude the accelerometer does not give a usable tilt.
///
/// Units: meters/second^2
const MIN_TILT_ACCEL_M_S2: f64 = 1.0;

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Handler registered for an input topic, if there is one.
pub fn handler_for(topic: TopicId) -> Option<Box<dyn TopicHandler>> {
    match topic {
        TopicId::SensorCombined => Some(Box::new(on_sensor_combined)),
        TopicId::ActuatorOutputs => Some(Box::new(on_actuator_outputs)),
        TopicId::VehicleThrustSetpoint => Some(Box::new(on_thrust_setpoint)),
        TopicId::VehicleAttitude | TopicId::ActuatorControls => None,
    }
}

/// Tilt attitude implied by the accelerometer, `None` when the sample is too small to use.
pub fn attitude_from_accel(raw: &SensorCombined) -> Option<VehicleAttitude> {
    let f = Vector3::new(
        raw.accelerometer_m_s2[0] as f64,
        raw.accelerometer_m_s2[1] as f64,
        raw.accelerometer_m_s2[2] as f64,
    );

    if !(f.norm() >= MIN_TILT_ACCEL_M_S2) {
        return None;
    }

    // At rest the accelerometer measures the reaction to gravity, which points up (-z)
    let roll = (-f.y).atan2(-f.z);
    let pitch = f.x.atan2((f.y * f.y + f.z * f.z).sqrt());

    let q = UnitQuaternion::from_euler_angles(roll, pitch, 0.0);

    Some(VehicleAttitude {
        timestamp_us: raw.timestamp_us,
        q: [q.w as f32, q.i as f32, q.j as f32, q.k as f32],
    })
}

/// Rotate the thrust setpoint into the body frame.
///
/// Channels 0-2 are the clamped body frame thrust, channel 3 the clamped thrust magnitude.
pub fn body_thrust(att: &VehicleAttitude, sp: &VehicleThrustSetpoint) -> ActuatorControls {
    let q = UnitQuaternion::from_quaternion(Quaternion::new(
        att.q[0] as f64,
        att.q[1] as f64,
        att.q[2] as f64,
        att.q[3] as f64,
    ));
    let thrust = Vector3::new(sp.xyz[0] as f64, sp.xyz[1] as f64, sp.xyz[2] as f64);

    let body = q.inverse_transform_vector(&thrust);

    let mut controls = ActuatorControls {
        timestamp_us: att.timestamp_us.max(sp.timestamp_us),
        ..Default::default()
    };

    for i in 0..3 {
        controls.control[i] = body[i].max(-1.0).min(1.0) as f32;
    }
    controls.control[3] = thrust.norm().min(1.0) as f32;

    controls
}

// ------------------------------------------------------------------------------------------------
// HANDLERS
// ------------------------------------------------------------------------------------------------

fn on_sensor_combined(
    msg: &Msg,
    inputs: &ObservedInputs,
    outputs: &mut DerivedOutputs,
) -> Result<(), HandlerError> {
    let raw = expect_msg(msg, TopicId::SensorCombined, Msg::as_sensor_combined)?;

    debug!(
        "Accelerometer: {:8.4} {:8.4} {:8.4} | Gyro: {:8.4} {:8.4} {:8.4}",
        raw.accelerometer_m_s2[0],
        raw.accelerometer_m_s2[1],
        raw.accelerometer_m_s2[2],
        raw.gyro_rad[0],
        raw.gyro_rad[1],
        raw.gyro_rad[2]
    );

    let att = match attitude_from_accel(raw) {
        Some(a) => a,
        None => {
            debug!(
                "Specific force below {} m/s^2, attitude not derived",
                MIN_TILT_ACCEL_M_S2
            );
            return Ok(());
        }
    };

    outputs.update(Msg::VehicleAttitude(att))?;

    if let Some(sp) = inputs.vehicle_thrust_setpoint() {
        outputs.update(Msg::ActuatorControls(body_thrust(&att, sp)))?;
    }

    Ok(())
}

fn on_thrust_setpoint(
    msg: &Msg,
    inputs: &ObservedInputs,
    outputs: &mut DerivedOutputs,
) -> Result<(), HandlerError> {
    let sp = expect_msg(
        msg,
        TopicId::VehicleThrustSetpoint,
        Msg::as_vehicle_thrust_setpoint,
    )?;

    let att = match inputs.sensor_combined().and_then(attitude_from_accel) {
        Some(a) => a,
        None => {
            debug!("No usable sensor sample yet, actuator controls not derived");
            return Ok(());
        }
    };

    outputs.update(Msg::ActuatorControls(body_thrust(&att, sp)))
}

fn on_actuator_outputs(
    msg: &Msg,
    _inputs: &ObservedInputs,
    _outputs: &mut DerivedOutputs,
) -> Result<(), HandlerError> {
    let out = expect_msg(msg, TopicId::ActuatorOutputs, Msg::as_actuator_outputs)?;

    info!(
        "Outputs: {:8.4} {:8.4} {:8.4} {:8.4}",
        out.output[0], out.output[1], out.output[2], out.output[3]
    );

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock_bus::ScriptedBus;
    use crate::node::{CancelToken, InputSpec, Node, NodeConfig};
    use comms_if::bus::{Bus, LocalBus, WaitOutcome};
    use comms_if::topic::ActuatorOutputs;
    use std::f64::consts::FRAC_PI_2;
    use std::time::Duration;

    const EPS: f32 = 1e-5;

    fn level(t: u64) -> SensorCombined {
        SensorCombined {
            timestamp_us: t,
            accelerometer_m_s2: [0.0, 0.0, -9.81],
            gyro_rad: [0.0; 3],
        }
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < EPS, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_attitude_from_accel() {
        let att = attitude_from_accel(&level(3)).unwrap();
        assert_eq!(att.timestamp_us, 3);
        assert_close(&att.q, &[1.0, 0.0, 0.0, 0.0]);

        // Rolled 90 degrees onto the right side, gravity reaction along -y
        let rolled = SensorCombined {
            accelerometer_m_s2: [0.0, -9.81, 0.0],
            ..level(0)
        };
        let att = attitude_from_accel(&rolled).unwrap();
        let half = (FRAC_PI_2 / 2.0) as f32;
        assert_close(&att.q, &[half.cos(), half.sin(), 0.0, 0.0]);

        // Free fall gives no tilt
        let falling = SensorCombined {
            accelerometer_m_s2: [0.0, 0.0, -0.1],
            ..level(0)
        };
        assert!(attitude_from_accel(&falling).is_none());
    }

    #[test]
    fn test_body_thrust() {
        let att = attitude_from_accel(&level(10)).unwrap();
        let sp = VehicleThrustSetpoint {
            timestamp_us: 20,
            xyz: [0.0, 0.0, -0.5],
        };

        let controls = body_thrust(&att, &sp);
        assert_eq!(controls.timestamp_us, 20);
        assert_close(&controls.control, &[0.0, 0.0, -0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);

        // Saturated demand is clamped per axis and in magnitude
        let sp = VehicleThrustSetpoint {
            timestamp_us: 0,
            xyz: [2.0, 0.0, -2.0],
        };
        let controls = body_thrust(&att, &sp);
        assert_eq!(controls.timestamp_us, 10);
        assert_close(&controls.control[..4], &[1.0, 0.0, -1.0, 1.0]);

        // Rolled 90 degrees, a downward thrust lies along body +y
        let rolled = attitude_from_accel(&SensorCombined {
            accelerometer_m_s2: [0.0, -9.81, 0.0],
            ..level(0)
        })
        .unwrap();
        let sp = VehicleThrustSetpoint {
            timestamp_us: 0,
            xyz: [0.0, 0.0, 0.5],
        };
        let controls = body_thrust(&rolled, &sp);
        assert_close(&controls.control[..3], &[0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_handler_table() {
        assert!(handler_for(TopicId::SensorCombined).is_some());
        assert!(handler_for(TopicId::ActuatorOutputs).is_some());
        assert!(handler_for(TopicId::VehicleThrustSetpoint).is_some());
        assert!(handler_for(TopicId::VehicleAttitude).is_none());
        assert!(handler_for(TopicId::ActuatorControls).is_none());
    }

    #[test]
    fn test_wrong_message_type() {
        let mut outputs = DerivedOutputs::default();
        let result = on_sensor_combined(
            &Msg::zeroed(TopicId::ActuatorOutputs),
            &ObservedInputs::default(),
            &mut outputs,
        );
        assert!(matches!(result, Err(HandlerError::UnexpectedMsg { .. })));
    }

    #[test]
    fn test_free_fall_samples_skipped() {
        let falling = |t: u64| {
            Msg::SensorCombined(SensorCombined {
                accelerometer_m_s2: [0.0, 0.0, -0.1],
                ..level(t)
            })
        };
        let sp = Msg::VehicleThrustSetpoint(VehicleThrustSetpoint {
            timestamp_us: 1,
            xyz: [0.0, 0.0, -0.5],
        });

        let bus = ScriptedBus::new()
            .ready(&[0, 1], vec![falling(1), sp])
            .ready(&[0], vec![falling(2)])
            .ready(&[0], vec![falling(3)])
            .ready(&[0], vec![Msg::SensorCombined(level(4))]);

        let inputs = [TopicId::SensorCombined, TopicId::VehicleThrustSetpoint]
            .iter()
            .map(|&t| InputSpec::new(t, Duration::from_millis(0), handler_for(t).unwrap()))
            .collect();

        let mut node = Node::new(
            bus,
            NodeConfig {
                inputs,
                outputs: OUTPUTS.to_vec(),
                wait_timeout: Duration::from_millis(10),
                cycle_budget: Some(4),
            },
        )
        .unwrap();
        node.run(&CancelToken::new());
        let (bus, report) = node.shutdown();

        assert_eq!(report.handler_errors, 0);
        assert_eq!(report.dispatch_count(TopicId::SensorCombined), 4);

        // Nothing goes out until the level sample on the fourth wait
        assert!(bus.published.iter().all(|(wait_call, _)| *wait_call == 4));
        assert_eq!(
            bus.published_topics(),
            vec![TopicId::VehicleAttitude, TopicId::ActuatorControls]
        );
    }

    /// Run the real handler table on a `LocalBus` and read the outputs back through the bus.
    #[test]
    fn test_node_on_local_bus() {
        let mut bus = LocalBus::new();

        let mut source = bus.clone();
        let sp_pub = source
            .advertise(
                TopicId::VehicleThrustSetpoint,
                &Msg::zeroed(TopicId::VehicleThrustSetpoint),
            )
            .unwrap();
        let sensor_pub = source
            .advertise(TopicId::SensorCombined, &Msg::zeroed(TopicId::SensorCombined))
            .unwrap();
        let out_pub = source
            .advertise(TopicId::ActuatorOutputs, &Msg::zeroed(TopicId::ActuatorOutputs))
            .unwrap();

        let inputs = [
            TopicId::SensorCombined,
            TopicId::ActuatorOutputs,
            TopicId::VehicleThrustSetpoint,
        ]
        .iter()
        .map(|&t| {
            InputSpec::new(
                t,
                Duration::from_millis(0),
                handler_for(t).unwrap(),
            )
        })
        .collect();

        let attitude_sub = bus.subscribe(TopicId::VehicleAttitude).unwrap();
        let controls_sub = bus.subscribe(TopicId::ActuatorControls).unwrap();

        let mut node = Node::new(
            bus.clone(),
            NodeConfig {
                inputs,
                outputs: OUTPUTS.to_vec(),
                wait_timeout: Duration::from_millis(200),
                cycle_budget: Some(1),
            },
        )
        .unwrap();

        // The advertised initial records were zeroed
        assert_eq!(
            bus.copy_latest(attitude_sub).unwrap(),
            Some(Msg::zeroed(TopicId::VehicleAttitude))
        );
        assert_eq!(
            bus.copy_latest(controls_sub).unwrap(),
            Some(Msg::zeroed(TopicId::ActuatorControls))
        );

        source
            .publish(
                sp_pub,
                &Msg::VehicleThrustSetpoint(VehicleThrustSetpoint {
                    timestamp_us: 5,
                    xyz: [0.0, 0.0, -0.5],
                }),
            )
            .unwrap();
        source
            .publish(sensor_pub, &Msg::SensorCombined(level(7)))
            .unwrap();
        source
            .publish(
                out_pub,
                &Msg::ActuatorOutputs(ActuatorOutputs {
                    timestamp_us: 7,
                    noutputs: 4,
                    ..Default::default()
                }),
            )
            .unwrap();

        node.run(&CancelToken::new());
        let (_, report) = node.shutdown();

        assert_eq!(report.ready_wakeups, 1);
        assert_eq!(report.dispatch_count(TopicId::SensorCombined), 1);
        assert_eq!(report.dispatch_count(TopicId::ActuatorOutputs), 1);
        assert_eq!(report.dispatch_count(TopicId::VehicleThrustSetpoint), 1);
        assert_eq!(report.publish_count(TopicId::VehicleAttitude), 1);
        assert_eq!(report.publish_count(TopicId::ActuatorControls), 1);

        assert!(matches!(
            bus.wait(&[attitude_sub, controls_sub], Duration::from_millis(10)),
            WaitOutcome::Ready(_)
        ));

        match bus.copy_latest(attitude_sub).unwrap() {
            Some(Msg::VehicleAttitude(att)) => {
                assert_eq!(att.timestamp_us, 7);
                assert_close(&att.q, &[1.0, 0.0, 0.0, 0.0]);
            }
            m => panic!("Expected attitude, got {:?}", m),
        }

        match bus.copy_latest(controls_sub).unwrap() {
            Some(Msg::ActuatorControls(c)) => {
                assert_eq!(c.timestamp_us, 7);
                assert_close(&c.control[..4], &[0.0, 0.0, -0.5, 0.5]);
            }
            m => panic!("Expected controls, got {:?}", m),
        }
    }
}
