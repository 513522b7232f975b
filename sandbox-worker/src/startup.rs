//! Attaches to the shared-memory slab and control-stream socket the host
//! prepared before spawning this process, retrying the socket connect
//! within the bounded window (spec §7 "Transport-fatal").

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::info;

use sandbox_ring::{HalfId, RingHalf, Slab};

const CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum StartupError {
    Shm(sandbox_ring::RingError),
    ControlStreamUnreachable,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shm(e) => write!(f, "failed to attach shared memory: {e}"),
            Self::ControlStreamUnreachable => {
                write!(f, "control stream socket not reachable within the retry window")
            }
        }
    }
}

impl std::error::Error for StartupError {}

impl From<sandbox_ring::RingError> for StartupError {
    fn from(e: sandbox_ring::RingError) -> Self {
        Self::Shm(e)
    }
}

/// The two ring halves plus the connected control-stream socket, ready to
/// build an `OutboundTransport`/`InboundTransport` pair over.
pub struct Attached {
    pub slab: Slab,
    pub control: UnixStream,
}

impl Attached {
    /// Ring A: host to worker (inbound). Ring B: worker to host (outbound).
    pub fn ring_a(&self) -> Result<RingHalf, StartupError> {
        let (base, len) = self.slab.half_ptr(HalfId::A);
        Ok(unsafe { RingHalf::attach(base, len)? })
    }

    pub fn ring_b(&self) -> Result<RingHalf, StartupError> {
        let (base, len) = self.slab.half_ptr(HalfId::B);
        Ok(unsafe { RingHalf::attach(base, len)? })
    }
}

pub fn attach(control_stream_path: &Path, shm_name: &str, shm_size: usize) -> Result<Attached, StartupError> {
    let slab = Slab::attach(shm_name, shm_size)?;

    let mut control = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(control_stream_path) {
            Ok(stream) => {
                control = Some(stream);
                break;
            }
            Err(e) => {
                info!(
                    "control stream connect attempt {}/{CONNECT_ATTEMPTS} failed: {e}",
                    attempt + 1
                );
                thread::sleep(CONNECT_BACKOFF);
            }
        }
    }

    let control = control.ok_or(StartupError::ControlStreamUnreachable)?;
    Ok(Attached { slab, control })
}
