//! Guarded variants of the four resource-acquiring operations. Each wraps
//! a [`PolicyClient`] handle and the self-exemption check, and is exposed
//! to evaluated code as a Lua global, replacing the language's ordinary
//! surface for that operation (spec §4.5 / §9 "In-process interception").

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use mlua::{Lua, MultiValue, UserData, UserDataMethods, Value, Variadic};

use sandbox_policy::{FsPerm, Probe};
use sandbox_protocol::{Decision, PolicyClient};
use sandbox_transport::MessageType;

use crate::capture::CaptureSink;
use crate::context::DenialFlag;

/// A file opened by guarded `io.open`. Exposes the handful of methods
/// evaluated code actually needs (`read`, `write`, `close`), mirroring
/// Lua's conventional file-handle surface closely enough that scripts
/// written against real `io.open` still work.
struct GuardedFile {
    file: Option<File>,
}

impl UserData for GuardedFile {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("read", |_, this, fmt: Option<String>| {
            let Some(file) = this.file.as_mut() else {
                return Ok(None);
            };
            let _ = fmt; // only whole-file reads are supported
            let mut buf = String::new();
            file.read_to_string(&mut buf)
                .map_err(mlua::Error::external)?;
            Ok(Some(buf))
        });

        methods.add_method_mut("write", |_, this, data: String| {
            if let Some(file) = this.file.as_mut() {
                file.write_all(data.as_bytes()).map_err(mlua::Error::external)?;
            }
            Ok(())
        });

        methods.add_method_mut("close", |_, this, ()| {
            this.file.take();
            Ok(())
        });
    }
}

/// Registers the guarded globals on `lua`, routing every probe through
/// `client` and exempting reads of `policy_path` from interception.
pub fn install<W: std::io::Write + 'static>(
    lua: &Lua,
    client: Rc<RefCell<PolicyClient<W>>>,
    policy_path: Option<PathBuf>,
    sink: Rc<CaptureSink<W>>,
    denial: DenialFlag,
) -> mlua::Result<()> {
    install_print(lua, Rc::clone(&sink))?;
    install_open(lua, Rc::clone(&client), policy_path.clone(), denial.clone())?;
    install_listdir(lua, Rc::clone(&client))?;
    install_exec(lua, Rc::clone(&client), denial.clone())?;
    install_connect(lua, client, denial)?;
    Ok(())
}

fn install_print<W: std::io::Write + 'static>(lua: &Lua, sink: Rc<CaptureSink<W>>) -> mlua::Result<()> {
    let tostring: mlua::Function = lua.globals().get("tostring")?;
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let mut parts = Vec::with_capacity(args.len());
        for value in args.into_iter() {
            let text: String = tostring.call(value)?;
            parts.push(text);
        }
        sink.write_str(&(parts.join("\t") + "\n"));
        Ok(())
    })?;
    lua.globals().set("print", print)?;
    Ok(())
}

/// Writes a `warn`-verdict audit line to captured output, if the probe
/// produced one (spec §8 scenario 4 "Net warn": the connection proceeds and
/// the evaluator's warning is surfaced as audit text).
fn emit_audit<W: std::io::Write>(client: &Rc<RefCell<PolicyClient<W>>>, audit: Option<String>) {
    if let Some(line) = audit {
        client.borrow_mut().send_stdout((line + "\n").into_bytes());
    }
}

fn is_self_exempt(path: &str, policy_path: &Option<PathBuf>) -> bool {
    let Some(policy_path) = policy_path else {
        return false;
    };
    let Ok(target) = Path::new(path).canonicalize() else {
        return false;
    };
    let Ok(policy) = policy_path.canonicalize() else {
        return false;
    };
    target == policy
}

fn install_open<W: std::io::Write + 'static>(
    lua: &Lua,
    client: Rc<RefCell<PolicyClient<W>>>,
    policy_path: Option<PathBuf>,
    denial: DenialFlag,
) -> mlua::Result<()> {
    let io_table: mlua::Table = lua.globals().get("io")?;
    let open = lua.create_function(move |_, (path, mode): (String, Option<String>)| {
        let mode = mode.unwrap_or_else(|| "r".to_string());
        let is_write = mode.chars().any(|c| matches!(c, 'w' | 'a' | '+' | 'x'));

        if !is_self_exempt(&path, &policy_path) {
            let probe = Probe::Fs {
                path: path.clone(),
                perm: if is_write { FsPerm::WriteFile } else { FsPerm::ReadFile },
            };
            if is_write {
                let outcome = client.borrow_mut().probe_sync(
                    MessageType::FsWrite,
                    path.clone().into_bytes(),
                    &probe,
                );
                if outcome.decision == Decision::Deny {
                    denial.set();
                    return Err(mlua::Error::RuntimeError(format!(
                        "file write denied: {path}"
                    )));
                }
                emit_audit(&client, outcome.audit);
            } else {
                let outcome = client.borrow_mut().probe_optimistic(
                    MessageType::FsRead,
                    path.clone().into_bytes(),
                    &probe,
                );
                emit_audit(&client, outcome.audit);
            }
        }

        let open_result = open_with_mode(&path, &mode);
        match open_result {
            Ok(file) => Ok(GuardedFile { file: Some(file) }),
            Err(e) => Err(mlua::Error::external(e)),
        }
    })?;
    io_table.set("open", open)?;
    Ok(())
}

fn open_with_mode(path: &str, mode: &str) -> std::io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    match mode {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "r+" => options.read(true).write(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a+" => options.read(true).append(true).create(true),
        // Python-style exclusive-create mode, carried over because the
        // write-detection check (spec §4.5) treats it as write-ish.
        "x" | "x+" => options.write(true).create_new(true),
        _ => options.read(true),
    };
    options.open(path)
}

fn install_listdir<W: std::io::Write + 'static>(
    lua: &Lua,
    client: Rc<RefCell<PolicyClient<W>>>,
) -> mlua::Result<()> {
    let listdir = lua.create_function(move |lua, path: String| {
        let probe = Probe::Fs {
            path: path.clone(),
            perm: FsPerm::ReadDir,
        };
        let outcome = client
            .borrow_mut()
            .probe_optimistic(MessageType::ListDir, path.clone().into_bytes(), &probe);
        emit_audit(&client, outcome.audit);

        let entries = std::fs::read_dir(&path).map_err(mlua::Error::external)?;
        let names: mlua::Result<Vec<String>> = entries
            .map(|entry| {
                entry
                    .map_err(mlua::Error::external)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
            })
            .collect();
        lua.create_sequence_from(names?)
    })?;
    lua.globals().set("listdir", listdir)?;
    Ok(())
}

fn install_exec<W: std::io::Write + 'static>(
    lua: &Lua,
    client: Rc<RefCell<PolicyClient<W>>>,
    denial: DenialFlag,
) -> mlua::Result<()> {
    let exec = lua.create_function(move |lua, argv: MultiValue| {
        let tokens = extract_argv(lua, argv)?;
        let Some(program) = tokens.first().cloned() else {
            return Err(mlua::Error::RuntimeError("exec requires a program".into()));
        };

        let probe = Probe::Exec { path: program.clone() };
        let outcome = client.borrow_mut().probe_sync(
            MessageType::Exec,
            program.clone().into_bytes(),
            &probe,
        );
        if outcome.decision == Decision::Deny {
            denial.set();
            return Err(mlua::Error::RuntimeError(format!("exec denied: {program}")));
        }
        emit_audit(&client, outcome.audit);

        let output = Command::new(&program)
            .args(&tokens[1..])
            .output()
            .map_err(mlua::Error::external)?;

        let table = lua.create_table()?;
        table.set("status", output.status.code().unwrap_or(-1))?;
        table.set("stdout", String::from_utf8_lossy(&output.stdout).into_owned())?;
        table.set("stderr", String::from_utf8_lossy(&output.stderr).into_owned())?;
        Ok(table)
    })?;
    lua.globals().set("exec", exec)?;
    Ok(())
}

/// Accepts either a sequence table of argv tokens or a single command
/// string, split on whitespace (spec §4.5 "Path derivation").
fn extract_argv(lua: &Lua, args: MultiValue) -> mlua::Result<Vec<String>> {
    let first = args.into_iter().next();
    match first {
        Some(Value::Table(table)) => {
            let len = table.raw_len();
            let mut tokens = Vec::with_capacity(len);
            for i in 1..=len {
                tokens.push(table.get::<String>(i)?);
            }
            Ok(tokens)
        }
        Some(Value::String(s)) => Ok(s
            .to_str()?
            .split_whitespace()
            .map(String::from)
            .collect()),
        _ => {
            let _ = lua;
            Err(mlua::Error::RuntimeError(
                "exec requires a command string or argv table".into(),
            ))
        }
    }
}

struct GuardedConnection {
    stream: Option<std::net::TcpStream>,
}

impl UserData for GuardedConnection {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("write", |_, this, data: String| {
            if let Some(stream) = this.stream.as_mut() {
                stream.write_all(data.as_bytes()).map_err(mlua::Error::external)?;
            }
            Ok(())
        });
        methods.add_method_mut("close", |_, this, ()| {
            this.stream.take();
            Ok(())
        });
    }
}

fn install_connect<W: std::io::Write + 'static>(
    lua: &Lua,
    client: Rc<RefCell<PolicyClient<W>>>,
    denial: DenialFlag,
) -> mlua::Result<()> {
    let connect = lua.create_function(move |_, (host, port): (String, u16)| {
        let addr_text = format!("{host}:{port}");
        // DNS names are valid connect targets too (the original
        // `guarded_create_connection` probes first and lets the real
        // connect resolve the name): only parse the host eagerly for
        // embedded CIDR matching, which needs a concrete address; an
        // unparseable host still gets a probe, just one no NET rule can
        // match (spec-adjacent: falls back to the section default).
        let addr = host.parse::<std::net::IpAddr>().ok();

        let probe = Probe::Net {
            addr,
            port,
            proto: "tcp".to_string(),
        };
        let outcome = client.borrow_mut().probe_sync(
            MessageType::NetConnect,
            addr_text.clone().into_bytes(),
            &probe,
        );
        if outcome.decision == Decision::Deny {
            denial.set();
            return Err(mlua::Error::RuntimeError(format!("net connect denied: {addr_text}")));
        }
        emit_audit(&client, outcome.audit);

        let stream = std::net::TcpStream::connect((host.as_str(), port)).map_err(mlua::Error::external)?;
        Ok(GuardedConnection { stream: Some(stream) })
    })?;
    lua.globals().set("connect", connect)?;
    Ok(())
}
