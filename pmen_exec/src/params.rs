//! # Node Parameters
//!
//! Parameters for the node executable, loaded from `pmen_exec.toml` in the parameters directory.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::time::Duration;

use serde::Deserialize;

use comms_if::topic::TopicId;

use crate::{
    dispatch::TopicHandler,
    handlers,
    node::{InputSpec, NodeConfig, NodeError},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NodeParams {
    /// Which bus the node runs on
    pub bus: BusKind,

    /// Input topics in registration order. This is also the order handlers run in.
    pub inputs: Vec<InputParams>,

    /// Maximum time to block in one wait.
    ///
    /// Units: milliseconds
    pub wait_timeout_ms: u64,

    /// Stop after this many loop cycles. Unset runs until cancelled.
    #[serde(default)]
    pub cycle_budget: Option<u64>,

    /// Exit with a failure if more wait errors than this occur during the run. Unset means wait
    /// errors never fail the run.
    #[serde(default)]
    pub max_wait_errors: Option<u64>,

    /// Minimum level written to the log, `"info"`, `"debug"` or `"trace"`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Synthetic data source used when running on the local bus without a replay script
    #[serde(default)]
    pub sim: SimParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputParams {
    pub topic: TopicId,

    /// Minimum time between two copies of the topic, zero for every update.
    ///
    /// Units: milliseconds
    #[serde(default)]
    pub period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimParams {
    /// Publish rate of the synthetic sensor and actuator output topics.
    ///
    /// Units: hertz
    pub rate_hz: f64,

    /// Time after the start of the run at which thrust setpoints start being published.
    ///
    /// Units: seconds
    pub thrust_start_s: f64,

    /// Amplitude of the synthetic roll oscillation.
    ///
    /// Units: radians
    pub roll_amplitude_rad: f64,

    /// Period of the synthetic roll oscillation.
    ///
    /// Units: seconds
    pub roll_period_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-process bus fed by the simulated or replayed data source
    Local,

    /// ZeroMQ bus configured by `net.toml`
    Net,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SimParams {
    fn default() -> Self {
        Self {
            rate_hz: 50.0,
            thrust_start_s: 1.0,
            roll_amplitude_rad: 0.2,
            roll_period_s: 4.0,
        }
    }
}

impl NodeParams {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Build the node configuration, attaching the handler registered for each input topic.
    pub fn to_config(&self) -> Result<NodeConfig, NodeError> {
        self.to_config_with(handlers::handler_for)
    }

    /// Build the node configuration with a custom handler table.
    pub fn to_config_with<F>(&self, handler_for: F) -> Result<NodeConfig, NodeError>
    where
        F: Fn(TopicId) -> Option<Box<dyn TopicHandler>>,
    {
        let mut inputs = Vec::with_capacity(self.inputs.len());

        for input in self.inputs.iter() {
            let handler = handler_for(input.topic).ok_or(NodeError::NoHandler(input.topic))?;
            inputs.push(InputSpec::new(
                input.topic,
                Duration::from_millis(input.period_ms),
                handler,
            ));
        }

        Ok(NodeConfig {
            inputs,
            outputs: handlers::OUTPUTS.to_vec(),
            wait_timeout: self.wait_timeout(),
            cycle_budget: self.cycle_budget,
        })
    }
}

fn default_log_level() -> String {
    "info".into()
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    const PARAMS: &str = r#"
        bus = "local"
        wait_timeout_ms = 1000
        cycle_budget = 200

        [[inputs]]
        topic = "sensor_combined"

        [[inputs]]
        topic = "actuator_outputs"
        period_ms = 200

        [[inputs]]
        topic = "vehicle_thrust_setpoint"
    "#;

    #[test]
    fn test_load_params() {
        let params: NodeParams = toml::from_str(PARAMS).unwrap();

        assert_eq!(params.bus, BusKind::Local);
        assert_eq!(params.wait_timeout(), Duration::from_secs(1));
        assert_eq!(params.cycle_budget, Some(200));
        assert_eq!(params.max_wait_errors, None);
        assert_eq!(params.log_level, "info");
        assert_eq!(params.inputs[0].period_ms, 0);
        assert_eq!(params.inputs[1].period_ms, 200);
        assert_eq!(params.sim.rate_hz, 50.0);

        let config = params.to_config().unwrap();
        let topics: Vec<_> = config.inputs.iter().map(|i| i.topic).collect();
        assert_eq!(
            topics,
            vec![
                TopicId::SensorCombined,
                TopicId::ActuatorOutputs,
                TopicId::VehicleThrustSetpoint
            ]
        );
        assert_eq!(config.inputs[1].period, Duration::from_millis(200));
        assert_eq!(config.outputs, handlers::OUTPUTS.to_vec());
    }

    #[test]
    fn test_input_without_handler() {
        let params: NodeParams = toml::from_str(
            r#"
            bus = "net"
            wait_timeout_ms = 10

            [[inputs]]
            topic = "vehicle_attitude"
        "#,
        )
        .unwrap();

        assert!(matches!(
            params.to_config(),
            Err(NodeError::NoHandler(TopicId::VehicleAttitude))
        ));
    }
}
