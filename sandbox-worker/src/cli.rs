//! Command-line surface: three positional arguments describe the transport
//! (control stream, shared-memory name and size); `--embedded` selects
//! local policy evaluation over deferring to the host.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
pub struct Cli {
    /// Path to the control-stream pipe (a fifo, or a connected fd passed by name).
    pub control_stream_path: PathBuf,

    /// Name of the shared-memory object to attach.
    pub shm_name: String,

    /// Total size in bytes of the shared-memory slab (split evenly between
    /// ring A and ring B).
    pub shm_size: usize,

    /// Evaluate policy locally against `POLICY_PATH` instead of deferring
    /// every probe to the host.
    #[arg(long)]
    pub embedded: bool,
}
