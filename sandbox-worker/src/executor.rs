//! Runs one frame of evaluated code against the persistent interpreter
//! context, emitting the state events the host observes around it (spec
//! §4.5 step-by-step: `code_received` / `exec_start` / `exec_end` or
//! `interrupted` or `exception`).

use std::cell::RefCell;
use std::rc::Rc;

use mlua::Value;
use serde_json::json;

use crate::context::{ExecutionContext, INTERRUPTED_MARKER};

use sandbox_protocol::PolicyClient;

pub struct Executor<W> {
    context: ExecutionContext,
    client: Rc<RefCell<PolicyClient<W>>>,
}

impl<W: std::io::Write> Executor<W> {
    pub fn new(context: ExecutionContext, client: Rc<RefCell<PolicyClient<W>>>) -> Self {
        Self { context, client }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Evaluates `code` against the persistent global table, emitting the
    /// state events the host observes around it.
    pub fn run_frame(&mut self, code: &str) {
        self.client
            .borrow_mut()
            .send_state_event("code_received", Some(json!({"code_length": code.len()})))
            .ok();

        self.context.interrupt.take();

        self.client.borrow_mut().send_state_event("exec_start", None).ok();

        let lua = &self.context.lua;

        // Mirrors the original's `try: eval(...) except SyntaxError: exec(...)`:
        // try the code as an expression first, falling back to statement form.
        let expr_source = format!("return ({code})");
        let result = match lua.load(expr_source.as_str()).eval::<Value>() {
            Ok(value) => Ok(value),
            Err(mlua::Error::SyntaxError { .. }) => lua.load(code).exec().map(|_| Value::Nil),
            Err(e) => Err(e),
        };

        match result {
            Ok(Value::Nil) => {
                self.client
                    .borrow_mut()
                    .send_state_event("exec_end", Some(json!({"success": true})))
                    .ok();
            }
            Ok(value) => {
                if let Ok(tostring) = lua.globals().get::<mlua::Function>("tostring") {
                    if let Ok(text) = tostring.call::<String>(value) {
                        self.write_output(&(text + "\n"));
                    }
                }
                self.client
                    .borrow_mut()
                    .send_state_event("exec_end", Some(json!({"success": true})))
                    .ok();
            }
            Err(e) => self.report_failure(e),
        }
    }

    fn report_failure(&mut self, err: mlua::Error) {
        if is_interrupt(&err) {
            self.client.borrow_mut().send_state_event("interrupted", None).ok();
            return;
        }

        // Every non-interrupt failure gets a traceback on stdout, not just
        // CallbackError: a plain RuntimeError (e.g. a Lua arithmetic error)
        // has no `traceback` field, so fall back to its Display text.
        let traceback = match &err {
            mlua::Error::CallbackError { traceback, .. } => traceback.clone(),
            other => other.to_string(),
        };
        self.write_output(&format!("{traceback}\n"));

        let kind = if self.context.denial.take() {
            "PermissionError"
        } else {
            error_kind(&err)
        };

        self.client
            .borrow_mut()
            .send_state_event(
                "exception",
                Some(json!({"error": format!("{kind}: {err}")})),
            )
            .ok();
    }

    fn write_output(&mut self, text: &str) {
        self.client.borrow_mut().send_stdout(text.as_bytes().to_vec());
    }
}

fn is_interrupt(err: &mlua::Error) -> bool {
    matches!(err, mlua::Error::RuntimeError(msg) if msg == INTERRUPTED_MARKER)
        || matches!(
            err,
            mlua::Error::CallbackError { cause, .. }
                if matches!(cause.as_ref(), mlua::Error::RuntimeError(msg) if msg == INTERRUPTED_MARKER)
        )
}

fn error_kind(err: &mlua::Error) -> &'static str {
    match err {
        mlua::Error::SyntaxError { .. } => "SyntaxError",
        mlua::Error::RuntimeError(_) => "RuntimeError",
        mlua::Error::CallbackError { .. } => "CallbackError",
        _ => "LuaError",
    }
}
