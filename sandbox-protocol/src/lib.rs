//! Translates intercepted calls into transport messages and interprets the
//! replies, in one of two modes: host-mediated (defer every decision to the
//! host over the rings) or embedded (resolve probes locally against a
//! compiled ruleset). Both modes live behind the same `PolicyClient` API so
//! `sandbox-worker`'s interception layer never has to branch on which one
//! is active.

use std::time::{Duration, Instant};

use log::{trace, warn};

use sandbox_policy::{CompiledEvaluator, Probe};
use sandbox_transport::{Envelope, InboundTransport, MessageType, OutboundTransport};

/// Wall-clock budget for a synchronous probe's reply in host-mediated mode
/// (spec §4.4). Exceeding it is treated as a denial.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// The result of resolving one probe: whether the underlying operation may
/// proceed, plus an optional human-readable audit line the caller should
/// write to captured output (emitted for `warn` verdicts; see spec §8
/// scenario 4 "Net warn").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub decision: Decision,
    pub audit: Option<String>,
}

impl ProbeOutcome {
    fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            audit: None,
        }
    }

    fn deny() -> Self {
        Self {
            decision: Decision::Deny,
            audit: None,
        }
    }

    fn warn(audit: String) -> Self {
        Self {
            decision: Decision::Allow,
            audit: Some(audit),
        }
    }
}

/// Which half of the unified policy-client abstraction is active (spec §9
/// "Open question": embedded and host-mediated evaluation are selectable
/// modes of the same abstraction rather than separate implementations).
pub enum Mode {
    Embedded(CompiledEvaluator),
    HostMediated,
}

/// Sends probes over the transport and resolves them, either by waiting
/// for the host's verdict or by consulting a local ruleset.
pub struct PolicyClient<W> {
    out: OutboundTransport<W>,
    inbound: InboundTransport,
    mode: Mode,
    /// When true, embedded mode still emits a wire probe for host-side
    /// audit parity even though it never waits for a reply. Default off:
    /// with no host reading ring B, the frame would just sit there.
    audit_local: bool,
}

impl<W: std::io::Write> PolicyClient<W> {
    pub fn new(out: OutboundTransport<W>, inbound: InboundTransport, mode: Mode) -> Self {
        Self {
            out,
            inbound,
            mode,
            audit_local: false,
        }
    }

    pub fn with_audit_local(mut self, audit_local: bool) -> Self {
        self.audit_local = audit_local;
        self
    }

    pub fn send_stdout(&mut self, body: Vec<u8>) {
        self.out.send_stdout(body);
    }

    pub fn send_ready(&mut self) -> std::io::Result<()> {
        self.out.send_ready()
    }

    pub fn send_state_event(
        &mut self,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> std::io::Result<()> {
        self.out.send_state_event(event, data)
    }

    /// Drains the next inbound frame not tied to an outstanding probe, for
    /// the worker's main loop to dispatch `CODE` frames from (spec §4.5
    /// "main.rs"). Probe replies in flight are consumed by `probe_sync`
    /// itself and never reach this path.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbound.try_recv()
    }

    /// Read-like probe: the caller proceeds immediately regardless of the
    /// outcome. Host-mediated mode just announces the probe; embedded mode
    /// evaluates locally and surfaces a `warn` as audit text, since reads
    /// are audited but never blocked (spec §9 "Mode selection").
    pub fn probe_optimistic(&mut self, msg_type: MessageType, body: Vec<u8>, probe: &Probe) -> ProbeOutcome {
        match &self.mode {
            Mode::HostMediated => {
                if let Err(e) = self.out.send_probe(msg_type, body) {
                    warn!("control stream error announcing optimistic probe: {e}");
                }
                ProbeOutcome::allow()
            }
            Mode::Embedded(evaluator) => {
                if self.audit_local {
                    if let Err(e) = self.out.send_probe(msg_type, body) {
                        warn!("control stream error announcing optimistic probe: {e}");
                    }
                }
                match evaluator.evaluate(probe) {
                    sandbox_policy::Action::Warn => ProbeOutcome::warn(audit_line(probe, sandbox_policy::Action::Warn)),
                    _ => ProbeOutcome::allow(),
                }
            }
        }
    }

    /// Mutating or externally-observable probe: the caller waits for an
    /// explicit verdict before proceeding.
    pub fn probe_sync(&mut self, msg_type: MessageType, body: Vec<u8>, probe: &Probe) -> ProbeOutcome {
        match &self.mode {
            Mode::HostMediated => self.probe_sync_host_mediated(msg_type, body),
            Mode::Embedded(evaluator) => {
                if self.audit_local {
                    if let Err(e) = self.out.send_probe(msg_type, body) {
                        warn!("control stream error announcing synchronous probe: {e}");
                    }
                }
                match evaluator.evaluate(probe) {
                    sandbox_policy::Action::Deny => ProbeOutcome::deny(),
                    sandbox_policy::Action::Warn => ProbeOutcome::warn(audit_line(probe, sandbox_policy::Action::Warn)),
                    sandbox_policy::Action::Allow => ProbeOutcome::allow(),
                }
            }
        }
    }

    fn probe_sync_host_mediated(&mut self, msg_type: MessageType, body: Vec<u8>) -> ProbeOutcome {
        let request_id = match self.out.send_probe(msg_type, body) {
            Ok(id) => id,
            Err(e) => {
                // Broken control stream on a probe means the host cannot be
                // expected to service it: treat as denied (spec §7
                // "Transport-recoverable").
                warn!("control stream error announcing synchronous probe, treating as denied: {e}");
                return ProbeOutcome::deny();
            }
        };

        let deadline = Instant::now() + PROBE_TIMEOUT;
        loop {
            match self.inbound.try_recv() {
                Some(envelope) if envelope.request_id == request_id => {
                    return match envelope.msg_type {
                        MessageType::Allow => ProbeOutcome::allow(),
                        MessageType::Deny => ProbeOutcome::deny(),
                        // A reply with a matching id but an unexpected type
                        // is a protocol inconsistency: treat as denied
                        // rather than guessing at intent.
                        _ => ProbeOutcome::deny(),
                    };
                }
                Some(other) => {
                    trace!(
                        "discarding reply with non-matching request_id {} (waiting for {request_id}): {:?}",
                        other.request_id, other.msg_type
                    );
                }
                None => {}
            }

            if Instant::now() >= deadline {
                warn!("synchronous probe {request_id} timed out after {PROBE_TIMEOUT:?}, treating as denied");
                return ProbeOutcome::deny();
            }

            std::thread::sleep(sandbox_transport::BACKOFF);
        }
    }
}

fn audit_line(probe: &Probe, action: sandbox_policy::Action) -> String {
    match probe {
        Probe::Fs { path, perm } => format!("{action:?} fs {perm:?} {path}"),
        Probe::Net { addr, port, proto } => {
            let addr = addr.map(|a| a.to_string()).unwrap_or_else(|| "<unresolved>".to_string());
            format!("{action:?} net {proto} {addr}:{port}")
        }
        Probe::Exec { path } => format!("{action:?} exec {path}"),
    }
}
