//! Line-delimited JSON protocol between the controller and its worker
//! processes.
//!
//! A worker is this same binary re-executed with the hidden `worker`
//! subcommand. The first stdin line is the [`WorkerSpec`]; every following
//! line is a [`WorkerCommand`]. The worker answers with [`WorkerEvent`]
//! lines on stdout and keeps stderr for logs. One JSON document per line,
//! nothing else on either pipe.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, Write};

use crate::batch::ProofBatch;
use crate::config::Device;
use crate::phase::Phase;
use crate::session::Session;

/// Everything a worker needs to build its compute and nonce slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub session: Session,
    pub device: Device,
    pub node_id: u32,
    pub node_count: u32,
    pub device_id: u32,
    pub device_count: u32,
}

/// Controller-to-worker messages. Phase commands have a single writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Phase { phase: Phase },
    Validate { batch: ProofBatch },
}

/// Worker-to-controller messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Model init finished; emitted exactly once.
    Ready,
    /// A filtered batch of proofs from the generate loop.
    Generated { batch: ProofBatch },
    /// Recomputed distances for one validation chunk.
    Validated { batch: ProofBatch },
    /// A non-fatal failure worth surfacing in the controller's logs.
    Error { message: String },
}

/// Writes one message as a JSON line and flushes.
pub fn write_line<T: Serialize, W: Write>(writer: &mut W, message: &T) -> io::Result<()> {
    let line = serde_json::to_string(message)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Reads the next JSON line, or `None` on a cleanly closed pipe.
pub fn read_line<T: DeserializeOwned, R: BufRead>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(io::Error::other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn commands_round_trip_over_a_pipe() {
        let mut buf = Vec::new();
        let command = WorkerCommand::Phase {
            phase: Phase::Generate,
        };
        write_line(&mut buf, &command).unwrap();
        write_line(
            &mut buf,
            &WorkerCommand::Validate {
                batch: ProofBatch::empty(),
            },
        )
        .unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        let first: WorkerCommand = read_line(&mut reader).unwrap().unwrap();
        assert_eq!(first, command);
        let second: WorkerCommand = read_line(&mut reader).unwrap().unwrap();
        assert!(matches!(second, WorkerCommand::Validate { .. }));
        assert!(read_line::<WorkerCommand, _>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn events_use_a_tagged_wire_format() {
        let json = serde_json::to_string(&WorkerEvent::Ready).unwrap();
        assert_eq!(json, r#"{"type":"ready"}"#);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut reader = BufReader::new("\n\n{\"type\":\"ready\"}\n".as_bytes());
        let event: WorkerEvent = read_line(&mut reader).unwrap().unwrap();
        assert_eq!(event, WorkerEvent::Ready);
    }
}
