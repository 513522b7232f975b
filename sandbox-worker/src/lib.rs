pub mod capture;
pub mod cli;
pub mod context;
pub mod executor;
pub mod guard;
pub mod startup;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use log::{error, info, trace};

use sandbox_policy::PolicyFile;
use sandbox_protocol::{Mode, PolicyClient};
use sandbox_transport::{ControlStream, InboundTransport, MessageType, OutboundTransport};

use capture::CaptureSink;
use cli::Cli;
use context::ExecutionContext;
use executor::Executor;

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Runs the worker to completion (it never returns under normal operation;
/// a transport-fatal condition at startup exits the process directly, per
/// spec §7).
pub fn run(args: Cli) {
    let attached = match startup::attach(&args.control_stream_path, &args.shm_name, args.shm_size) {
        Ok(attached) => attached,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let ring_a = match attached.ring_a() {
        Ok(ring) => ring,
        Err(e) => {
            error!("failed to attach ring A: {e}");
            std::process::exit(1);
        }
    };
    let ring_b = match attached.ring_b() {
        Ok(ring) => ring,
        Err(e) => {
            error!("failed to attach ring B: {e}");
            std::process::exit(1);
        }
    };

    let control_write = match attached.control.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to clone control stream: {e}");
            std::process::exit(1);
        }
    };

    let policy_path = std::env::var("POLICY_PATH").ok().map(PathBuf::from);

    let mode = if args.embedded {
        let Some(path) = policy_path.clone() else {
            error!("--embedded requires POLICY_PATH to be set");
            std::process::exit(1);
        };
        let mut policy_file = PolicyFile::new(path);
        match policy_file.current() {
            Ok(evaluator) => Mode::Embedded(evaluator.clone()),
            Err(e) => {
                error!("failed to load policy file: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Mode::HostMediated
    };

    let out = OutboundTransport::new(ring_b, ControlStream::new(control_write));
    let inbound = InboundTransport::new(ring_a);
    let client = Rc::new(RefCell::new(PolicyClient::new(out, inbound, mode)));

    if let Err(e) = client.borrow_mut().send_ready() {
        error!("failed to send READY: {e}");
        std::process::exit(1);
    }

    let execution_context = match ExecutionContext::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("failed to initialize interpreter: {e}");
            std::process::exit(1);
        }
    };

    let interrupt = execution_context.interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || interrupt.set()) {
        error!("failed to install interrupt handler: {e}");
    }

    let sink = Rc::new(CaptureSink::new(Rc::clone(&client)));
    let denial = execution_context.denial.clone();
    if let Err(e) = guard::install(&execution_context.lua, Rc::clone(&client), policy_path, sink, denial) {
        error!("failed to install guarded globals: {e}");
        std::process::exit(1);
    }

    let mut executor = Executor::new(execution_context, Rc::clone(&client));

    info!("worker ready, entering main loop");
    loop {
        let frame = client.borrow_mut().try_recv();
        match frame {
            Some(envelope) if envelope.msg_type == MessageType::Code => {
                let code = String::from_utf8_lossy(&envelope.body).into_owned();
                executor.run_frame(&code);
            }
            Some(other) => {
                trace!("discarding non-CODE frame: {:?}", other.msg_type);
            }
            None => std::thread::sleep(IDLE_BACKOFF),
        }
    }
}
