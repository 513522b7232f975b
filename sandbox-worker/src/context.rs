//! The persistent interpreter state evaluated code runs against: one
//! `mlua::Lua` instance whose global table survives across frames, standing
//! in for the original's per-worker `global_context` dict.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mlua::{Lua, VmState};

/// Sentinel message on the `RuntimeError` the interrupt hook raises, so
/// `Executor::run_frame` can tell an interruption apart from any other
/// script-raised error.
pub const INTERRUPTED_MARKER: &str = "__sandbox_worker_interrupted__";

/// Set by the worker's Ctrl-C handler, checked from the interpreter's
/// interrupt hook (spec §4.5 step 5 "interrupted").
#[derive(Clone)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Set by a guarded operation right before it raises a denial error, so
/// `Executor::run_frame` can report a stable `PermissionError` kind instead
/// of leaking the underlying `mlua` error-variant name (spec §8 scenarios
/// 2/3: `state:exception{error:"PermissionError: …"}`). Single-threaded:
/// guarded closures and the executor run on the same thread, unlike
/// `InterruptFlag`, which a signal handler sets from elsewhere.
#[derive(Clone)]
pub struct DenialFlag(Rc<Cell<bool>>);

impl DenialFlag {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(false)))
    }

    pub fn set(&self) {
        self.0.set(true);
    }

    pub fn take(&self) -> bool {
        self.0.replace(false)
    }
}

pub struct ExecutionContext {
    pub lua: Lua,
    pub interrupt: InterruptFlag,
    pub denial: DenialFlag,
}

impl ExecutionContext {
    pub fn new() -> mlua::Result<Self> {
        let lua = Lua::new();
        lua.globals().set("_NAME", "__main__")?;

        let interrupt = InterruptFlag::new();
        let hook_flag = interrupt.clone();
        lua.set_interrupt(move |_| {
            if hook_flag.0.load(Ordering::SeqCst) {
                Err(mlua::Error::RuntimeError(INTERRUPTED_MARKER.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        });

        Ok(Self {
            lua,
            interrupt,
            denial: DenialFlag::new(),
        })
    }
}
