//! A host-side implementation of a subset of WASI
//!
//! This library lets sandboxed WASM programs perform console and flat
//! filesystem I/O through the `wasi_snapshot_preview1` imports, served from an
//! emulated filesystem instead of real OS calls.  The host calls are
//! implemented once, in `WasiShim`, against any `MemoryHandler`; the optional
//! Wasmtime engine (feature `std`) links them into a module and runs it.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#[macro_use]
extern crate num_derive;

pub mod abi;
pub mod engines;
pub mod fd_table;
pub mod fs;
pub mod iovec;
pub mod layout;
pub mod memory;

// Expose the errors and the shim to the external.
pub use engines::common::{
    ExecutionEngine, FatalShimError, HostCallError, HostResult, WasiAPIName, WasiShim,
};
pub use fs::{BackingFileSystem, HostFileSystem, MemoryFileSystem};
pub use memory::{Detached, LinearMemory, MemoryHandler};

#[cfg(feature = "std")]
use crate::engines::wasmtime::WasmtimeRuntimeState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Runtime options for a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// A list of key-value pairs corresponding to the environment variables of the
    /// program, if any.
    pub environment_variables: Vec<(String, String)>,
    /// A list of strings, corresponding to the command-line arguments of the program,
    /// if any.
    pub program_arguments: Vec<String>,
    /// Whether clock-related functionality is enabled for the program.  If not
    /// enabled, clock- and time-related WASI host-calls return `Access` and
    /// file timestamps read as zero.
    pub enable_clock: bool,
    /// Whether strace-like output is enabled.
    pub enable_strace: bool,
    /// Initial contents of the program's stdin.
    pub stdin: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            environment_variables: Vec::new(),
            program_arguments: Vec::new(),
            enable_clock: true,
            enable_strace: false,
            stdin: Vec::new(),
        }
    }
}

impl Options {
    /// Parses options from JSON.  Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Creates a session over `filesystem`, forwarding the guest's standard
/// output and error to `stdout` and `stderr`.  The guest must be attached (its
/// memory supplied to every call) before any host call is made.
pub fn setup<F, O, E>(filesystem: F, stdout: O, stderr: E) -> WasiShim
where
    F: BackingFileSystem + 'static,
    O: FnMut(&str) + Send + 'static,
    E: FnMut(&str) + Send + 'static,
{
    WasiShim::new(filesystem, stdout, stderr)
}

/// The top-level function executes program `program` over `filesystem`,
/// writing its standard output and error to those of the host process.
/// Returns the program's exit code.
///
/// Note that the `execute` function is essentially this library's
/// interface to the outside world, and details exactly what external clients
/// such as `freestanding-wasi-shim` can rely on.
pub fn execute<F>(filesystem: F, program: Vec<u8>, options: Options) -> Result<u32>
where
    F: BackingFileSystem + 'static,
{
    let shim = setup(
        filesystem,
        |text| {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        },
        |text| {
            let _ = std::io::stderr().write_all(text.as_bytes());
        },
    )
    .with_options(options);
    execute_shim(shim, program)
}

/// As `execute`, with a session the caller has already set up.
pub fn execute_shim(shim: WasiShim, program: Vec<u8>) -> Result<u32> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            let mut engine: Box<dyn ExecutionEngine> = Box::new(WasmtimeRuntimeState::new(shim));
            engine.invoke_entry_point(program)
        } else {
            let _ = (shim, program);
            Err(anyhow::anyhow!(FatalShimError::EngineIsNotReady))
        }
    }
}
