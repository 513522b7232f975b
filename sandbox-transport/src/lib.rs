//! Framed transport: envelopes carried as ring frames, plus the control
//! stream used for readiness signalling.

pub mod control;
pub mod envelope;
pub mod pipe;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::trace;

pub use control::ControlStream;
pub use envelope::{DecodeError, Envelope, MessageType, UnknownMessageType};
use sandbox_ring::RingHalf;

/// How long a producer sleeps between retries when a ring is full.
pub const BACKOFF: Duration = Duration::from_millis(1);

/// The outbound half of the transport: writes envelopes into a ring and
/// announces them on the control stream.
pub struct OutboundTransport<W> {
    ring: RingHalf,
    control: ControlStream<W>,
    next_request_id: AtomicU32,
}

impl<W: std::io::Write> OutboundTransport<W> {
    pub fn new(ring: RingHalf, control: ControlStream<W>) -> Self {
        Self {
            ring,
            control,
            // Request ids start at 1, matching the original implementation's
            // `req_id = 1` (the counter is pre-incremented before first use).
            next_request_id: AtomicU32::new(1),
        }
    }

    fn alloc_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write_blocking(&self, bytes: &[u8]) {
        loop {
            if self.ring.write(bytes) > 0 {
                return;
            }
            std::thread::sleep(BACKOFF);
        }
    }

    /// Sends a policy probe, allocating a fresh `request_id`, and announces
    /// it with a `CHECK` token. Returns the allocated id so the caller can
    /// correlate a reply.
    pub fn send_probe(&mut self, msg_type: MessageType, body: Vec<u8>) -> std::io::Result<u32> {
        let request_id = self.alloc_request_id();
        let envelope = Envelope {
            msg_type,
            request_id,
            body,
        };
        self.write_blocking(&envelope.encode());
        self.control.send_check_token()?;
        Ok(request_id)
    }

    /// Sends captured output as a `STDOUT` envelope (`request_id` unused)
    /// and announces it with a `DATA` token. Best-effort on the control
    /// stream: a broken pipe here is logged and swallowed.
    pub fn send_stdout(&mut self, body: Vec<u8>) {
        let envelope = Envelope {
            msg_type: MessageType::Stdout,
            request_id: 0,
            body,
        };
        self.write_blocking(&envelope.encode());
        self.control.send_data_token();
    }

    pub fn send_ready(&mut self) -> std::io::Result<()> {
        self.control.send_ready()
    }

    pub fn send_state_event(
        &mut self,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> std::io::Result<()> {
        self.control.send_state_event(event, data)
    }
}

/// The inbound half of the transport: drains envelopes from a ring.
pub struct InboundTransport {
    ring: RingHalf,
}

impl InboundTransport {
    pub fn new(ring: RingHalf) -> Self {
        Self { ring }
    }

    /// Returns the next envelope, if a complete frame is available.
    ///
    /// A frame whose envelope is malformed (too short, or an unrecognized
    /// type byte) is a protocol-inconsistency (spec §7): it is silently
    /// discarded and the next frame, if any, is attempted instead of
    /// propagating the error to the caller.
    pub fn try_recv(&self) -> Option<Envelope> {
        loop {
            let frame = self.ring.read()?;
            match Envelope::decode(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    trace!("discarding malformed frame: {e}");
                    continue;
                }
            }
        }
    }
}
