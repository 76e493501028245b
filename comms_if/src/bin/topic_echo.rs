//! Print every message published on a networked topic.
//!
//! ```text
//! topic_echo sensor_combined --endpoint tcp://localhost:5010 --period-ms 200
//! ```

use comms_if::{
    bus::{Bus, WaitOutcome},
    net::{NetParams, TopicEndpoint, ZmqBus},
    topic::TopicId,
};
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "topic_echo", about = "Print messages published on a bus topic")]
struct Opts {
    /// Name of the topic to listen to, e.g. `vehicle_attitude`
    topic: TopicId,

    /// Endpoint the topic's publisher is bound to
    #[structopt(short, long, default_value = "tcp://localhost:5010")]
    endpoint: String,

    /// Minimum period between two printed messages in milliseconds
    #[structopt(short, long, default_value = "0")]
    period_ms: u64,

    /// Stop after this many messages
    #[structopt(short, long)]
    count: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::from_args();

    let mut params = NetParams::default();
    params.endpoints.insert(
        opts.topic.name().to_string(),
        TopicEndpoint {
            bind: opts.endpoint.clone(),
            connect: opts.endpoint.clone(),
        },
    );

    let mut bus = ZmqBus::new(params);
    let sub = bus.subscribe(opts.topic)?;
    bus.set_interval(sub, Duration::from_millis(opts.period_ms))?;

    println!("Listening to {} on {}", opts.topic, opts.endpoint);

    let mut num_received = 0;

    while opts.count.map(|c| num_received < c).unwrap_or(true) {
        match bus.wait(&[sub], Duration::from_secs(1)) {
            WaitOutcome::Ready(_) => {
                if let Some(msg) = bus.copy_latest(sub)? {
                    println!("{}", serde_json::to_string(&msg)?);
                    num_received += 1;
                }
            }
            WaitOutcome::Timeout => println!("Got no data within a second"),
            WaitOutcome::Error(e) => return Err(e.into()),
        }
    }

    Ok(())
}
