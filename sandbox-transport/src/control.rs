//! The control stream: ASCII readiness tokens and JSON state-event lines,
//! all worker→host, line-delimited.

use std::io::{self, Write};

use log::warn;
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
struct StateEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Writes readiness tokens and state events to a control-stream writer.
///
/// The worker never reads from this stream; only the host does.
pub struct ControlStream<W> {
    writer: W,
}

impl<W: Write> ControlStream<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn send_ready(&mut self) -> io::Result<()> {
        self.writer.write_all(b"READY\n")
    }

    /// Best-effort: a broken pipe here means captured output cannot be
    /// announced, but the frame is already in ring B, so this is logged and
    /// ignored rather than propagated (spec §4.2 "Flow control").
    pub fn send_data_token(&mut self) {
        if let Err(e) = self.writer.write_all(b"DATA\n") {
            warn!("control stream broken while sending DATA token: {e}");
        }
    }

    /// Unlike `send_data_token`, a broken pipe here is propagated: the probe
    /// it announces cannot be serviced without a host, so the caller should
    /// treat the outstanding probe as denied.
    pub fn send_check_token(&mut self) -> io::Result<()> {
        self.writer.write_all(b"CHECK\n").inspect_err(|e| {
            warn!("control stream broken while sending CHECK token (host is gone): {e}");
        })
    }

    pub fn send_state_event(&mut self, event: &str, data: Option<Value>) -> io::Result<()> {
        let line = serde_json::to_string(&StateEvent {
            kind: "state",
            event,
            data,
        })
        .expect("StateEvent always serializes");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }
}
