//! # Replay script module
//!
//! Replay scripts let a bench run feed recorded or hand written topic messages onto the bus at
//! fixed times. A script is a sequence of entries of the form
//!
//! ```text
//! <time_s>: <message json>;
//! ```
//!
//! where the time is the number of seconds after the replay starts and the message uses the bus
//! JSON encoding, e.g.
//!
//! ```text
//! 0.5: {"topic": "vehicle_thrust_setpoint", "data": {"timestamp_us": 500000, "xyz": [0.0, 0.0, -0.4]}};
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use regex::RegexBuilder;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

// Internal
use comms_if::topic::Msg;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A message which is scripted to be published at a specific time.
#[derive(Debug)]
struct Entry {
    /// The time the message is due, in seconds after the start of the replay
    pub_time_s: f64,

    msg: Msg
}

/// A loaded replay script.
///
/// The replay clock starts on the first call to [`ReplayScript::pending`].
#[derive(Debug)]
pub struct ReplayScript {
    script_path: PathBuf,
    entries: VecDeque<Entry>,
    start: Option<Instant>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Could not find the script at {0:?}")]
    ScriptNotFound(PathBuf),

    #[error("Could not load the script: {0}")]
    ScriptLoadError(std::io::Error),

    #[error("The script is empty (or is so bad it can't be read)")]
    ScriptEmpty,

    #[error(
        "Script contains an invalid timestamp: {0}. \
        Should be a float (like 1.0)")]
    InvalidTimestamp(String),

    #[error("Script contains an invalid message at {0} s: {1}")]
    InvalidMsg(f64, serde_json::Error),

    #[error("Script entry at {0} s is earlier than the entry before it")]
    OutOfOrder(f64)
}

/// Messages due for publishing.
#[derive(Debug, PartialEq)]
pub enum PendingMsgs {
    None,
    Some(Vec<Msg>),
    EndOfScript
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ReplayScript {

    /// Load a script from the given path.
    pub fn new<P: AsRef<Path>>(script_path: P) -> Result<Self, ReplayError> {

        let path = PathBuf::from(script_path.as_ref());

        if !path.exists() {
            return Err(ReplayError::ScriptNotFound(path));
        }

        let script = fs::read_to_string(&path)
            .map_err(ReplayError::ScriptLoadError)?;

        let mut replay = Self::parse(&script)?;
        replay.script_path = path;

        Ok(replay)
    }

    /// Parse a script held in memory.
    pub fn parse(script: &str) -> Result<Self, ReplayError> {

        let mut entries: VecDeque<Entry> = VecDeque::new();

        // Go through the script executing __the magic regex__.
        let re = RegexBuilder::
            new(r"^\s*(\d+(\.\d+)?)\s*:\s*([^;]*);")
            .multi_line(true)
            .build()
            .expect("replay script regex is valid");

        for cap in re.captures_iter(script) {
            // Groups 1 and 3 always participate in a match
            let (time_str, msg_str) = match (cap.get(1), cap.get(3)) {
                (Some(t), Some(m)) => (t.as_str(), m.as_str()),
                _ => continue
            };

            let pub_time_s: f64 = time_str.parse()
                .map_err(|e| ReplayError::InvalidTimestamp(format!("{}", e)))?;

            let msg = Msg::from_json(msg_str)
                .map_err(|e| ReplayError::InvalidMsg(pub_time_s, e))?;

            if let Some(last) = entries.back() {
                if pub_time_s < last.pub_time_s {
                    return Err(ReplayError::OutOfOrder(pub_time_s));
                }
            }

            entries.push_back(Entry {
                pub_time_s,
                msg
            });
        }

        if entries.is_empty() {
            return Err(ReplayError::ScriptEmpty)
        }

        Ok(ReplayScript {
            script_path: PathBuf::new(),
            entries,
            start: None
        })
    }

    /// Return the messages that are now due, starting the replay clock if needed.
    pub fn pending(&mut self) -> PendingMsgs {
        let start = *self.start.get_or_insert_with(Instant::now);
        self.pending_at(start.elapsed().as_secs_f64())
    }

    /// Return the messages due at `elapsed_s` seconds after the start of the replay.
    pub fn pending_at(&mut self, elapsed_s: f64) -> PendingMsgs {

        // If the queue is empty the script is over
        if self.entries.is_empty() {
            return PendingMsgs::EndOfScript
        }

        let mut msgs: Vec<Msg> = vec![];

        while let Some(entry) = self.entries.front() {
            if entry.pub_time_s > elapsed_s {
                break;
            }

            if let Some(entry) = self.entries.pop_front() {
                msgs.push(entry.msg);
            }
        }

        if msgs.is_empty() {
            PendingMsgs::None
        }
        else {
            PendingMsgs::Some(msgs)
        }
    }

    /// Get the number of messages left in the script
    pub fn num_msgs(&self) -> usize {
        self.entries.len()
    }

    /// Get the length of the script in seconds
    pub fn duration_s(&self) -> f64 {
        match self.entries.back() {
            Some(e) => e.pub_time_s,
            None => 0f64
        }
    }

    /// Path the script was loaded from, empty for in-memory scripts.
    pub fn path(&self) -> &Path {
        &self.script_path
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
