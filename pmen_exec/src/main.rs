//! # PMEN node executable
//!
//! Runs the poll/dispatch node until its cycle budget is spent or Ctrl-C is pressed.
//!
//! ```text
//! pmen_exec [replay_script]
//! ```
//!
//! On the local bus, inputs come from the synthetic source, or from the replay script if one is
//! given. On the networked bus they come from whatever publishes on the endpoints in `net.toml`.
//!
//! At exit the run report is saved as `run_report.json` in the session directory.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use std::env;
use color_eyre::{Result, eyre::{WrapErr, eyre}};
use log::{debug, info, warn};

// Internal
use comms_if::bus::{Bus, LocalBus};
use pmen_lib::{
    node::{CancelToken, Node, RunReport},
    params::{BusKind, NodeParams},
    source::{self, DataSource},
};
use util::{
    logger::{logger_init, parse_level},
    replay::ReplayScript,
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// MAIN
// ------------------------------------------------------------------------------------------------

fn main() -> Result<()> {

    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    let params: NodeParams = util::params::load("pmen_exec.toml")
        .wrap_err("Could not load pmen_exec params")?;

    // Initialise session
    let session = Session::new(
        "pmen_exec",
        "sessions"
    ).wrap_err("Failed to create the session")?;

    // Initialise logger
    let level = parse_level(&params.log_level)
        .wrap_err("Invalid log level in pmen_exec params")?;
    logger_init(level, &session)
        .wrap_err("Failed to initialise logging")?;

    info!("PMEN Node Executable\n");
    info!("Session directory: {:?}\n", session.session_root);
    debug!("Parameters: {:#?}", params);

    // ---- DATA SOURCE ----

    let args: Vec<String> = env::args().collect();
    debug!("CLI arguments: {:?}", args);

    let replay = match args.len() {
        1 => None,
        2 => {
            info!("Loading replay script from \"{}\"", &args[1]);
            let script = ReplayScript::new(&args[1])
                .wrap_err("Failed to load replay script")?;
            info!(
                "Loaded script lasts {:.02} s and contains {} messages\n",
                script.duration_s(),
                script.num_msgs()
            );
            Some(script)
        },
        n => return Err(eyre!(
            "Expected either zero or one argument, found {}", n - 1
        ))
    };

    // ---- CANCELLATION ----

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .wrap_err("Failed to set the Ctrl-C handler")?;
    }

    // ---- RUN ----

    let report = match params.bus {
        BusKind::Local => {
            let bus = LocalBus::new();

            let data_source = match replay {
                Some(script) => DataSource::Replay(script),
                None => DataSource::Sim(params.sim.clone())
            };

            let source_thread = source::spawn(bus.clone(), data_source, cancel.clone())
                .wrap_err("Failed to start the data source")?;

            let report = run_node(bus, &params, &cancel);

            // Stop the source whichever way the node finished
            cancel.cancel();
            if source_thread.join().is_err() {
                warn!("Data source thread panicked");
            }

            report?
        },
        BusKind::Net => {
            if replay.is_some() {
                return Err(eyre!("Replay scripts can only be played onto the local bus"));
            }
            run_net(&params, &cancel)?
        }
    };

    // ---- SHUTDOWN ----

    let report_path = session.save_json("run_report.json", &report)
        .wrap_err("Failed to save the run report")?;
    info!("Run report saved to {:?}", report_path);

    if let Some(max) = params.max_wait_errors {
        if report.wait_errors > max {
            return Err(eyre!(
                "{} wait errors occured, more than the allowed {}",
                report.wait_errors,
                max
            ));
        }
    }

    info!("End of execution");

    Ok(())
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn run_node<B: Bus>(bus: B, params: &NodeParams, cancel: &CancelToken) -> Result<RunReport> {
    let config = params.to_config()
        .wrap_err("Invalid node configuration")?;

    let mut node = Node::new(bus, config)
        .wrap_err("Failed to start the node")?;
    info!("Node initialised, entering main loop\n");

    node.run(cancel);

    let (_, report) = node.shutdown();
    Ok(report)
}

#[cfg(feature = "net")]
fn run_net(params: &NodeParams, cancel: &CancelToken) -> Result<RunReport> {
    let net_params: comms_if::net::NetParams = util::params::load("net.toml")
        .wrap_err("Could not load net params")?;

    run_node(comms_if::net::ZmqBus::new(net_params), params, cancel)
}

#[cfg(not(feature = "net"))]
fn run_net(_params: &NodeParams, _cancel: &CancelToken) -> Result<RunReport> {
    Err(eyre!("The networked bus needs the `net` feature"))
}
