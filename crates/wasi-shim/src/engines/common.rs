//! Common code for any implementation of the WASI shim:
//! - The names of the supported host calls.
//! - The errors a host call can raise.
//! - The per-guest `WasiShim`, which converts wasm number- and address-based
//!   parameters to properly typed values, performs the call against the
//!   descriptor table and the backing filesystem, and converts the outcome
//!   back to a C-style status code.
//! - An interface for executing a program.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#![allow(non_camel_case_types, clippy::too_many_arguments)]

use crate::{
    abi::{oflags, ClockId, ErrNo, Fd, FdStat, FileStat, FileType, IoVec, PreopenType, Prestat},
    engines::strace::Strace,
    fd_table::{Descriptor, DescriptorTable},
    fs::{normalize_path, BackingFileSystem, FileSystemResult},
    iovec::{gather_bytes, gather_write, scatter_read},
    memory::MemoryHandler,
    Options,
};
use anyhow::Result;
use err_derive::Error;
use log::{error, info, warn};
use num_traits::FromPrimitive;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use strum_macros::{EnumString, IntoStaticStr};

////////////////////////////////////////////////////////////////////////////////
// Common constants.
////////////////////////////////////////////////////////////////////////////////

/// List of supported WASI API.
/// It can be converted between primitive numbers and enum values via `primitive` related derive,
/// and between lowercase str and enum values via `strum`.
#[derive(
    IntoStaticStr,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
    Copy,
)]
#[strum(serialize_all = "lowercase")]
pub enum WasiAPIName {
    ARGS_GET = 1,
    ARGS_SIZES_GET,
    ENVIRON_GET,
    ENVIRON_SIZES_GET,
    CLOCK_RES_GET,
    CLOCK_TIME_GET,
    FD_CLOSE,
    FD_FDSTAT_GET,
    FD_FDSTAT_SET_FLAGS,
    FD_PRESTAT_GET,
    FD_PRESTAT_DIR_NAME,
    FD_READ,
    FD_SEEK,
    FD_WRITE,
    PATH_FILESTAT_GET,
    PATH_OPEN,
    PROC_EXIT,
    RANDOM_GET,
}

impl WasiAPIName {
    /// Every supported host call, in declaration order.
    pub const ALL: [WasiAPIName; 18] = [
        WasiAPIName::ARGS_GET,
        WasiAPIName::ARGS_SIZES_GET,
        WasiAPIName::ENVIRON_GET,
        WasiAPIName::ENVIRON_SIZES_GET,
        WasiAPIName::CLOCK_RES_GET,
        WasiAPIName::CLOCK_TIME_GET,
        WasiAPIName::FD_CLOSE,
        WasiAPIName::FD_FDSTAT_GET,
        WasiAPIName::FD_FDSTAT_SET_FLAGS,
        WasiAPIName::FD_PRESTAT_GET,
        WasiAPIName::FD_PRESTAT_DIR_NAME,
        WasiAPIName::FD_READ,
        WasiAPIName::FD_SEEK,
        WasiAPIName::FD_WRITE,
        WasiAPIName::PATH_FILESTAT_GET,
        WasiAPIName::PATH_OPEN,
        WasiAPIName::PROC_EXIT,
        WasiAPIName::RANDOM_GET,
    ];

    /// Number of integer arguments the host call takes.  `clock_res_get` is
    /// listed with its one-argument form, which returns the resolution
    /// directly; `dispatch` also accepts the two-argument form.
    pub fn arity(self) -> usize {
        match self {
            WasiAPIName::FD_CLOSE | WasiAPIName::PROC_EXIT | WasiAPIName::CLOCK_RES_GET => 1,
            WasiAPIName::ARGS_GET
            | WasiAPIName::ARGS_SIZES_GET
            | WasiAPIName::ENVIRON_GET
            | WasiAPIName::ENVIRON_SIZES_GET
            | WasiAPIName::FD_FDSTAT_GET
            | WasiAPIName::FD_FDSTAT_SET_FLAGS
            | WasiAPIName::FD_PRESTAT_GET
            | WasiAPIName::RANDOM_GET => 2,
            WasiAPIName::CLOCK_TIME_GET | WasiAPIName::FD_PRESTAT_DIR_NAME => 3,
            WasiAPIName::FD_READ | WasiAPIName::FD_SEEK | WasiAPIName::FD_WRITE => 4,
            WasiAPIName::PATH_FILESTAT_GET => 5,
            WasiAPIName::PATH_OPEN => 9,
        }
    }
}

/// Paths that name the standard streams.  They are reported as character
/// devices whether or not the backing filesystem knows them.
pub const STDIO_DEVICE_PATHS: [&str; 4] = ["/dev/stdin", "/dev/stdout", "/dev/stderr", "/dev/tty"];

/// Resolution reported for the realtime clock, in nanoseconds.
pub const REALTIME_CLOCK_RESOLUTION: u64 = 1_000_000_000;

////////////////////////////////////////////////////////////////////////////////
// Fatal execution errors/runtime panics.
////////////////////////////////////////////////////////////////////////////////

/// A fatal, runtime error that terminates the execution immediately.  These
/// errors are not passed to the WASM program, but are instead embedding
/// mistakes or engine failures that cannot be fixed by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FatalShimError {
    /// No linear memory was registered: the guest was not attached, or it
    /// does not export `memory`.
    #[error(
        display = "FatalShimError: No WASM memory registered. The guest must be attached and export `memory` before any call."
    )]
    NoMemoryRegistered,
    /// The guest does not export an allocator.
    #[error(display = "FatalShimError: No guest allocator registered (expected an export `malloc`).")]
    NoAllocatorRegistered,
    #[error(display = "FatalShimError: The guest allocator failed: {}.", _0)]
    AllocatorFailed(String),
    /// The shim was passed bad arguments by the WASM program.
    #[error(
        display = "FatalShimError: Bad arguments passed to host function '{:?}'.",
        function_name
    )]
    BadArgumentsToHostFunction {
        /// The name of the host function that was being invoked.
        function_name: WasiAPIName,
    },
    /// The WASM program tried to invoke an unknown host call.
    #[error(display = "FatalShimError: Unknown Host call invoked: '{}'.", _0)]
    UnknownHostFunction(String),
    /// The WASM program's entry point was missing or malformed.
    #[error(display = "FatalShimError: Failed to find the entry point in the WASM program.")]
    NoProgramEntryPoint,
    #[error(display = "FatalShimError: Execution engine is not ready.")]
    EngineIsNotReady,
    #[error(display = "FatalShimError: Failed to obtain lock on the shim.")]
    FailedToObtainLock,
}

/// How a host call failed: either with an error code for the guest, or
/// fatally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostCallError {
    #[error(display = "guest error {:?}", _0)]
    Guest(ErrNo),
    #[error(display = "{}", _0)]
    Fatal(FatalShimError),
}

impl From<ErrNo> for HostCallError {
    #[inline]
    fn from(errno: ErrNo) -> Self {
        HostCallError::Guest(errno)
    }
}

impl From<FatalShimError> for HostCallError {
    #[inline]
    fn from(error: FatalShimError) -> Self {
        HostCallError::Fatal(error)
    }
}

/// The outcome of the body of a host call.
pub type HostResult<T> = std::result::Result<T, HostCallError>;

/// A text sink for the guest's standard output or error.
pub type Sink = Box<dyn FnMut(&str) + Send>;

////////////////////////////////////////////////////////////////////////////////
// The host runtime state.
////////////////////////////////////////////////////////////////////////////////

/// The state of one guest session: every host call operates on one of these.
pub struct WasiShim {
    /// The filesystem the guest's `/` is served from.
    filesystem: Box<dyn BackingFileSystem>,
    /// Open file descriptors, including the standard streams and the root.
    descriptors: DescriptorTable,
    /// Bytes not yet read by the guest from descriptor 0.
    stdin: Vec<u8>,
    /// The exit code, if program calls proc_exit.
    exit_code: Option<u32>,
    stdout: Sink,
    stderr: Sink,
    options: Options,
}

impl WasiShim {
    /// The name of the WASM program's entry point.
    pub const ENTRY_POINT_NAME: &'static str = "_start";
    /// The name of the WASM program's linear memory.
    pub const LINEAR_MEMORY_NAME: &'static str = "memory";
    /// The name of the WASM program's exported allocator.
    pub const ALLOCATOR_NAME: &'static str = "malloc";
    /// The name of the containing module for all WASI imports.
    pub const WASI_SNAPSHOT_MODULE_NAME: &'static str = "wasi_snapshot_preview1";

    ////////////////////////////////////////////////////////////////////////////
    // Creating and modifying runtime states.
    ////////////////////////////////////////////////////////////////////////////

    /// Creates a session over `filesystem` writing the guest's standard output
    /// and error to `stdout` and `stderr`, with default options.
    pub fn new<F, O, E>(filesystem: F, stdout: O, stderr: E) -> Self
    where
        F: BackingFileSystem + 'static,
        O: FnMut(&str) + Send + 'static,
        E: FnMut(&str) + Send + 'static,
    {
        Self {
            filesystem: Box::new(filesystem),
            descriptors: DescriptorTable::new(),
            stdin: Vec::new(),
            exit_code: None,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            options: Options::default(),
        }
    }

    /// Replaces the options, queueing `options.stdin` on the stdin buffer.
    pub fn with_options(mut self, options: Options) -> Self {
        self.stdin.extend_from_slice(&options.stdin);
        self.options = options;
        self
    }

    /// Appends `bytes` to what the guest will read from descriptor 0.
    pub fn push_stdin(&mut self, bytes: &[u8]) {
        self.stdin.extend_from_slice(bytes);
    }

    /// Bytes queued on stdin and not read yet.
    #[inline]
    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    /// Return the exit code from `proc_exit` call.
    #[inline]
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn strace(&self, func: WasiAPIName) -> Strace {
        Strace::func(self.options.enable_strace, func.into())
    }

    /// Converts the outcome of a host call to the status returned to the
    /// guest.  Guest errors are logged and reported as `BadF`; fatal errors
    /// are passed on to the engine.
    fn status(func: WasiAPIName, result: HostResult<()>) -> std::result::Result<u32, FatalShimError> {
        match result {
            Ok(()) => Ok(ErrNo::Success.into()),
            Err(HostCallError::Guest(errno)) => {
                let name: &'static str = func.into();
                warn!("{} failed with {:?}", name, errno);
                Ok(ErrNo::BadF.into())
            }
            Err(HostCallError::Fatal(fatal)) => {
                let name: &'static str = func.into();
                error!("{} failed fatally: {}", name, fatal);
                Err(fatal)
            }
        }
    }

    /// As `status`, but reports the guest error itself.  Used by the clock
    /// calls, whose unsupported clocks are `Inval`.
    fn clock_status(
        func: WasiAPIName,
        result: HostResult<()>,
    ) -> std::result::Result<u32, FatalShimError> {
        match result {
            Err(HostCallError::Guest(errno)) => {
                let name: &'static str = func.into();
                warn!("{} failed with {:?}", name, errno);
                Ok(errno.into())
            }
            otherwise => Self::status(func, otherwise),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Internal helpers.
    ////////////////////////////////////////////////////////////////////////////

    /// Converts `arg` of type `R` to type `T`,
    /// or returns from the function with the `Inval` error code.
    #[inline]
    fn decode_wasi_arg<T: TryFrom<R>, R>(arg: R) -> FileSystemResult<T> {
        T::try_from(arg).map_err(|_| ErrNo::Inval)
    }

    /// Resolves `path` against the directory open at `dir_fd`.
    fn resolve(&self, dir_fd: Fd, path: &str) -> FileSystemResult<String> {
        match self.descriptors.get(dir_fd)? {
            Descriptor::PreopenDirectory { name: base } | Descriptor::Directory { path: base, .. } => {
                Ok(normalize_path(base, path))
            }
            _otherwise => Err(ErrNo::NotDir),
        }
    }

    fn is_stdio_device(path: &str) -> bool {
        STDIO_DEVICE_PATHS.contains(&path)
    }

    /// Attributes of the absolute `path`, classified as a character device,
    /// a directory or a regular file.  Timestamps are zero when the clock is
    /// disabled.
    fn filestat(&self, path: &str) -> FileSystemResult<FileStat> {
        let mut stat = match self.filesystem.stat(path) {
            Ok(metadata) => FileStat::from(&metadata),
            Err(_) if Self::is_stdio_device(path) => FileStat::character_device(),
            Err(e) => return Err(e),
        };
        stat.file_type = if Self::is_stdio_device(path) {
            FileType::CharacterDevice
        } else if stat.file_type == FileType::Directory {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        if !self.options.enable_clock {
            stat.atime = 0;
            stat.mtime = 0;
            stat.ctime = 0;
        }
        Ok(stat)
    }

    fn realtime_nanos() -> FileSystemResult<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| ErrNo::Io)?;
        u64::try_from(now.as_nanos()).map_err(|_| ErrNo::Overflow)
    }

    /// Only the realtime clock is served.
    fn check_clock(&self, clock_id: u32) -> FileSystemResult<()> {
        if !self.options.enable_clock {
            return Err(ErrNo::Access);
        }
        match ClockId::from_u32(clock_id) {
            Some(ClockId::RealTime) => Ok(()),
            _otherwise => Err(ErrNo::Inval),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // WASI implementation
    ////////////////////////////////////////////////////////////////////////////

    /// The implementation of the WASI `args_get` function.
    pub fn args_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address_for_string_ptrs: u32,
        buf_address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::ARGS_GET);
        let result = (|| -> HostResult<()> {
            let buffer = self
                .options
                .program_arguments
                .iter()
                .map(|arg| format!("{}\0", arg).into_bytes())
                .collect::<Vec<_>>();
            memory_ref.write_string_list(&buffer, buf_address, address_for_string_ptrs)
        })();
        strace.arg_dots();
        Self::status(WasiAPIName::ARGS_GET, strace.result(result))
    }

    /// The implementation of the WASI `args_sizes_get` function.
    pub fn args_sizes_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address_for_counts: u32,
        address_for_buffer_size: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::ARGS_SIZES_GET);
        let result = (|| -> HostResult<()> {
            let argc = self.options.program_arguments.len();
            let argv_buf_size = self
                .options
                .program_arguments
                .iter()
                .fold(0, |acc, arg| acc + arg.len() + 1);
            memory_ref.write_u32(address_for_counts, Self::decode_wasi_arg(argc)?)?;
            memory_ref.write_u32(address_for_buffer_size, Self::decode_wasi_arg(argv_buf_size)?)
        })();
        strace.arg_p_u32(memory_ref, address_for_counts);
        strace.arg_p_u32(memory_ref, address_for_buffer_size);
        Self::status(WasiAPIName::ARGS_SIZES_GET, strace.result(result))
    }

    /// The implementation of the WASI `environ_get` function.
    pub fn environ_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address_for_string_ptrs: u32,
        buf_address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::ENVIRON_GET);
        let result = (|| -> HostResult<()> {
            let buffer = self
                .options
                .environment_variables
                .iter()
                .map(|(key, value)| format!("{}={}\0", key, value).into_bytes())
                .collect::<Vec<_>>();
            memory_ref.write_string_list(&buffer, buf_address, address_for_string_ptrs)
        })();
        strace.arg_dots();
        Self::status(WasiAPIName::ENVIRON_GET, strace.result(result))
    }

    /// The implementation of the WASI `environ_sizes_get` function.
    pub fn environ_sizes_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address_for_counts: u32,
        address_for_buffer_size: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::ENVIRON_SIZES_GET);
        let result = (|| -> HostResult<()> {
            let environc = self.options.environment_variables.len();
            let environ_buf_size = self
                .options
                .environment_variables
                .iter()
                .fold(0, |acc, (key, value)| acc + key.len() + value.len() + 2);
            memory_ref.write_u32(address_for_counts, Self::decode_wasi_arg(environc)?)?;
            memory_ref.write_u32(
                address_for_buffer_size,
                Self::decode_wasi_arg(environ_buf_size)?,
            )
        })();
        strace.arg_p_u32(memory_ref, address_for_counts);
        strace.arg_p_u32(memory_ref, address_for_buffer_size);
        Self::status(WasiAPIName::ENVIRON_SIZES_GET, strace.result(result))
    }

    /// The one-argument `clock_res_get`: returns the resolution of
    /// `clock_id` in nanoseconds, or an error code (`Inval` for unsupported
    /// clocks) in its place.
    pub fn clock_res_get(&mut self, clock_id: u32) -> u64 {
        let mut strace = self.strace(WasiAPIName::CLOCK_RES_GET);
        let result = self.check_clock(clock_id).map_err(HostCallError::from);
        strace.arg_dec(clock_id);
        match strace.result(result) {
            Ok(()) => REALTIME_CLOCK_RESOLUTION,
            Err(HostCallError::Guest(errno)) => {
                warn!("clock_res_get failed with {:?}", errno);
                errno as u64
            }
            // `check_clock` never fails fatally.
            Err(HostCallError::Fatal(_)) => ErrNo::Inval as u64,
        }
    }

    /// The standard two-argument `clock_res_get`, writing the resolution of
    /// `clock_id` to `address`.
    pub fn clock_res_get_into<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        clock_id: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::CLOCK_RES_GET);
        let result = (|| -> HostResult<()> {
            self.check_clock(clock_id)?;
            memory_ref.write_u64(address, REALTIME_CLOCK_RESOLUTION)
        })();
        strace.arg_dec(clock_id);
        strace.arg_p_u64(memory_ref, address);
        Self::clock_status(WasiAPIName::CLOCK_RES_GET, strace.result(result))
    }

    /// The implementation of the WASI `clock_time_get` function.  The time is
    /// in nanoseconds, rounded down to a multiple of `precision`.
    pub fn clock_time_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        clock_id: u32,
        precision: u64,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::CLOCK_TIME_GET);
        let result = (|| -> HostResult<()> {
            self.check_clock(clock_id)?;
            let now = Self::realtime_nanos()?;
            let now = if precision > 1 {
                now - now % precision
            } else {
                now
            };
            memory_ref.write_u64(address, now)
        })();
        strace.arg_dec(clock_id);
        strace.arg_dec(precision);
        strace.arg_p_u64(memory_ref, address);
        Self::clock_status(WasiAPIName::CLOCK_TIME_GET, strace.result(result))
    }

    /// The implementation of the WASI `fd_close` function.
    pub fn fd_close(&mut self, fd: u32) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_CLOSE);
        let result = self.descriptors.close(fd.into()).map_err(HostCallError::from);
        strace.arg_dec(fd);
        Self::status(WasiAPIName::FD_CLOSE, strace.result(result))
    }

    /// The implementation of the WASI `fd_fdstat_get` function.
    pub fn fd_fdstat_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_FDSTAT_GET);
        let result = (|| -> HostResult<()> {
            let descriptor = self.descriptors.get(fd.into())?;
            let mut stat = descriptor.fdstat();
            if let Descriptor::File { path, .. } | Descriptor::Directory { path, .. } = descriptor {
                stat.file_type = self.filestat(path)?.file_type;
            }
            memory_ref.pack(address, &stat)
        })();
        strace.arg_dec(fd);
        strace.arg_record::<FdStat, _>(result.is_ok(), memory_ref, address);
        Self::status(WasiAPIName::FD_FDSTAT_GET, strace.result(result))
    }

    /// The implementation of the WASI `fd_fdstat_set_flags` function.  The
    /// flags are recorded on opened files but not acted upon.
    pub fn fd_fdstat_set_flags<T: MemoryHandler>(
        &mut self,
        _: &mut T,
        fd: u32,
        flags: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_FDSTAT_SET_FLAGS);
        let result = (|| -> HostResult<()> {
            let flags: u16 = Self::decode_wasi_arg(flags)?;
            if let Ok(Descriptor::File { fdstat, .. }) | Ok(Descriptor::Directory { fdstat, .. }) =
                self.descriptors.get_mut(fd.into())
            {
                fdstat.flags = flags;
            }
            Ok(())
        })();
        strace.arg_dec(fd);
        strace.arg_hex(flags);
        Self::status(WasiAPIName::FD_FDSTAT_SET_FLAGS, strace.result(result))
    }

    /// The implementation of the WASI `fd_prestat_get` function.
    pub fn fd_prestat_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_PRESTAT_GET);
        let result = (|| -> HostResult<()> {
            let name = match self.descriptors.get(fd.into())? {
                Descriptor::PreopenDirectory { name } => name,
                _otherwise => return Err(ErrNo::BadF.into()),
            };
            let prestat = Prestat {
                tag: PreopenType::Dir,
                name_len: Self::decode_wasi_arg(name.len())?,
            };
            memory_ref.pack(address, &prestat)
        })();
        strace.arg_dec(fd);
        strace.arg_record::<Prestat, _>(result.is_ok(), memory_ref, address);
        Self::status(WasiAPIName::FD_PRESTAT_GET, strace.result(result))
    }

    /// The implementation of the WASI `fd_prestat_dir_name` function.
    pub fn fd_prestat_dir_name<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        address: u32,
        size: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_PRESTAT_DIR_NAME);
        let result = (|| -> HostResult<()> {
            let name = match self.descriptors.get(fd.into())? {
                Descriptor::PreopenDirectory { name } => name,
                _otherwise => return Err(ErrNo::BadF.into()),
            };
            if name.len() > size as usize {
                return Err(ErrNo::NameTooLong.into());
            }
            memory_ref.write_buffer(address, name.as_bytes())
        })();
        strace.arg_dec(fd);
        strace.arg_path(memory_ref, address, size);
        strace.arg_dec(size);
        Self::status(WasiAPIName::FD_PRESTAT_DIR_NAME, strace.result(result))
    }

    /// The implementation of the WASI `fd_read` function.
    ///
    /// Descriptor 0 drains the stdin buffer.  Regular files are read from
    /// the backing filesystem in full on their first read, and then served
    /// from the descriptor's current offset.
    pub fn fd_read<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_READ);
        let result = (|| -> HostResult<()> {
            let iovecs = memory_ref.unpack_array::<IoVec>(iovec_base, iovec_count)?;
            // The count must be storable before stdin is drained.
            memory_ref.get_slice_mut(address, 4)?;
            let size_read = match self.descriptors.get_mut(fd.into())? {
                Descriptor::Stdin => {
                    let size_read = scatter_read(memory_ref, &iovecs, &self.stdin)?;
                    self.stdin.drain(..size_read as usize);
                    size_read
                }
                Descriptor::File {
                    path,
                    offset,
                    content,
                    ..
                } => {
                    if content.is_none() {
                        *content = Some(self.filesystem.read_file(path)?);
                    }
                    let data: &[u8] = content.as_deref().unwrap_or(&[]);
                    let start = usize::try_from(*offset).map_or(data.len(), |o| o.min(data.len()));
                    let size_read = scatter_read(memory_ref, &iovecs, &data[start..])?;
                    *offset += u64::from(size_read);
                    size_read
                }
                Descriptor::PreopenDirectory { .. } | Descriptor::Directory { .. } => {
                    return Err(ErrNo::IsDir.into())
                }
                Descriptor::Stdout | Descriptor::Stderr => return Err(ErrNo::BadF.into()),
            };
            memory_ref.write_u32(address, size_read)
        })();
        strace.arg_dec(fd);
        strace.arg_iovec(result.is_ok(), memory_ref, iovec_base, iovec_count, address);
        strace.arg_p_u32(memory_ref, address);
        Self::status(WasiAPIName::FD_READ, strace.result(result))
    }

    /// The implementation of the WASI `fd_seek` function.  Seeking is not
    /// supported: the call succeeds, leaves the offset where it is and
    /// reports it.
    pub fn fd_seek<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        offset: i64,
        whence: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_SEEK);
        let result = (|| -> HostResult<()> {
            let current = match self.descriptors.get(fd.into()) {
                Ok(Descriptor::File { offset, .. }) => *offset,
                _otherwise => 0,
            };
            memory_ref.write_u64(address, current)
        })();
        strace.arg_dec(fd);
        strace.arg_dec(offset);
        strace.arg_dec(whence);
        strace.arg_p_u64(memory_ref, address);
        Self::status(WasiAPIName::FD_SEEK, strace.result(result))
    }

    /// The implementation of the WASI `fd_write` function.
    ///
    /// Descriptors 1 and 2 forward the text to the stdout and stderr sinks in
    /// a single call.  Writes to opened files are accepted and counted but
    /// not stored.
    pub fn fd_write<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::FD_WRITE);
        let result = (|| -> HostResult<()> {
            let iovecs = memory_ref.unpack_array::<IoVec>(iovec_base, iovec_count)?;
            // The count must be storable before anything reaches a sink.
            memory_ref.get_slice_mut(address, 4)?;
            let size_written = match self.descriptors.get(fd.into())? {
                Descriptor::Stdout => {
                    let (text, size_written) = gather_write(memory_ref, &iovecs)?;
                    (self.stdout)(&text);
                    size_written
                }
                Descriptor::Stderr => {
                    let (text, size_written) = gather_write(memory_ref, &iovecs)?;
                    (self.stderr)(&text);
                    size_written
                }
                Descriptor::File { path, .. } => {
                    let bytes = gather_bytes(memory_ref, &iovecs)?;
                    warn!("fd_write: {} bytes to {} are not persisted", bytes.len(), path);
                    Self::decode_wasi_arg(bytes.len())?
                }
                Descriptor::PreopenDirectory { .. } | Descriptor::Directory { .. } => {
                    return Err(ErrNo::IsDir.into())
                }
                Descriptor::Stdin => return Err(ErrNo::BadF.into()),
            };
            memory_ref.write_u32(address, size_written)
        })();
        strace.arg_dec(fd);
        strace.arg_iovec(result.is_ok(), memory_ref, iovec_base, iovec_count, address);
        strace.arg_p_u32(memory_ref, address);
        Self::status(WasiAPIName::FD_WRITE, strace.result(result))
    }

    /// The implementation of the WASI `path_filestat_get` function.
    pub fn path_filestat_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        flags: u32,
        path_address: u32,
        path_length: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::PATH_FILESTAT_GET);
        let result = (|| -> HostResult<()> {
            let path = memory_ref.read_cstring(path_address, path_length)?;
            let path = self.resolve(fd.into(), &path)?;
            let stat = self.filestat(&path)?;
            memory_ref.pack(address, &stat)
        })();
        strace.arg_dec(fd);
        strace.arg_hex(flags);
        strace.arg_path(memory_ref, path_address, path_length);
        strace.arg_record::<FileStat, _>(result.is_ok(), memory_ref, address);
        Self::status(WasiAPIName::PATH_FILESTAT_GET, strace.result(result))
    }

    /// The implementation of the WASI `path_open` function.  The rights and
    /// flags are recorded in the new descriptor's fdstat but not enforced.
    pub fn path_open<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        dir_flags: u32,
        path_address: u32,
        path_length: u32,
        oflags: u32,
        rights_base: u64,
        rights_inheriting: u64,
        fd_flags: u32,
        address: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::PATH_OPEN);
        let result = (|| -> HostResult<()> {
            let open_flags: u16 = Self::decode_wasi_arg(oflags)?;
            let fd_flags: u16 = Self::decode_wasi_arg(fd_flags)?;
            let path = memory_ref.read_cstring(path_address, path_length)?;
            let path = self.resolve(fd.into(), &path)?;
            let metadata = self.filesystem.stat(&path)?;
            if u32::from(open_flags) & oflags::DIRECTORY != 0 && !metadata.is_dir() {
                return Err(ErrNo::NotDir.into());
            }
            let fdstat = FdStat {
                file_type: if metadata.is_dir() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
                flags: fd_flags,
                rights_base,
                rights_inheriting,
            };
            let new_fd = if metadata.is_dir() {
                self.descriptors.open_directory(path, fdstat)?
            } else {
                self.descriptors.open_file(path, fdstat)?
            };
            if let Err(e) = memory_ref.write_u32(address, new_fd.into()) {
                // The guest never learns about the descriptor, so release it.
                let _ = self.descriptors.close(new_fd);
                return Err(e);
            }
            Ok(())
        })();
        strace.arg_dec(fd);
        strace.arg_hex(dir_flags);
        strace.arg_path(memory_ref, path_address, path_length);
        strace.arg_hex(oflags);
        strace.arg_hex(rights_base);
        strace.arg_hex(rights_inheriting);
        strace.arg_hex(fd_flags);
        if result.is_ok() {
            strace.arg_p_u32(memory_ref, address);
        } else {
            strace.arg_dec("_");
        }
        Self::status(WasiAPIName::PATH_OPEN, strace.result(result))
    }

    /// The implementation of the WASI `proc_exit` function.  There is no
    /// real termination: the exit code is recorded and the call returns.
    pub fn proc_exit(&mut self, exit_code: u32) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::PROC_EXIT);
        (self.stderr)(&format!("exit {}", exit_code));
        self.exit_code = Some(exit_code);
        info!("proc_exit called with exit code {}", exit_code);
        strace.arg_dec(exit_code);
        Self::status(WasiAPIName::PROC_EXIT, strace.result(Ok(())))
    }

    /// The implementation of the WASI `random_get` function.  Exactly the
    /// bytes in `[address, address + length)` are overwritten.
    pub fn random_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address: u32,
        length: u32,
    ) -> std::result::Result<u32, FatalShimError> {
        let mut strace = self.strace(WasiAPIName::RANDOM_GET);
        let result = (|| -> HostResult<()> {
            let buffer = memory_ref.get_slice_mut(address, length)?;
            rand::thread_rng().fill_bytes(buffer);
            Ok(())
        })();
        strace.arg_hex(address);
        strace.arg_dec(length);
        Self::status(WasiAPIName::RANDOM_GET, strace.result(result))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Name-based dispatch.
    ////////////////////////////////////////////////////////////////////////////

    /// Invokes the host call `name` with raw integer arguments, as an engine
    /// without typed imports would.  Returns the value to hand back to the
    /// guest: a status code, or the resolution for the one-argument
    /// `clock_res_get`.
    pub fn dispatch<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        name: &str,
        args: &[u64],
    ) -> std::result::Result<u64, FatalShimError> {
        let function_name = WasiAPIName::from_str(name)
            .map_err(|_| FatalShimError::UnknownHostFunction(name.to_string()))?;
        let bad_arguments = || FatalShimError::BadArgumentsToHostFunction { function_name };

        if function_name == WasiAPIName::CLOCK_RES_GET && args.len() == 2 {
            let clock_id = u32::try_from(args[0]).map_err(|_| bad_arguments())?;
            let address = u32::try_from(args[1]).map_err(|_| bad_arguments())?;
            return Ok(self.clock_res_get_into(memory_ref, clock_id, address)?.into());
        }
        if args.len() != function_name.arity() {
            return Err(bad_arguments());
        }
        let a = |i: usize| u32::try_from(args[i]).map_err(|_| bad_arguments());

        let status = match function_name {
            WasiAPIName::ARGS_GET => self.args_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::ARGS_SIZES_GET => self.args_sizes_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::ENVIRON_GET => self.environ_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::ENVIRON_SIZES_GET => self.environ_sizes_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::CLOCK_RES_GET => return Ok(self.clock_res_get(a(0)?)),
            WasiAPIName::CLOCK_TIME_GET => {
                self.clock_time_get(memory_ref, a(0)?, args[1], a(2)?)?
            }
            WasiAPIName::FD_CLOSE => self.fd_close(a(0)?)?,
            WasiAPIName::FD_FDSTAT_GET => self.fd_fdstat_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::FD_FDSTAT_SET_FLAGS => {
                self.fd_fdstat_set_flags(memory_ref, a(0)?, a(1)?)?
            }
            WasiAPIName::FD_PRESTAT_GET => self.fd_prestat_get(memory_ref, a(0)?, a(1)?)?,
            WasiAPIName::FD_PRESTAT_DIR_NAME => {
                self.fd_prestat_dir_name(memory_ref, a(0)?, a(1)?, a(2)?)?
            }
            WasiAPIName::FD_READ => self.fd_read(memory_ref, a(0)?, a(1)?, a(2)?, a(3)?)?,
            WasiAPIName::FD_SEEK => {
                self.fd_seek(memory_ref, a(0)?, args[1] as i64, a(2)?, a(3)?)?
            }
            WasiAPIName::FD_WRITE => self.fd_write(memory_ref, a(0)?, a(1)?, a(2)?, a(3)?)?,
            WasiAPIName::PATH_FILESTAT_GET => {
                self.path_filestat_get(memory_ref, a(0)?, a(1)?, a(2)?, a(3)?, a(4)?)?
            }
            WasiAPIName::PATH_OPEN => self.path_open(
                memory_ref,
                a(0)?,
                a(1)?,
                a(2)?,
                a(3)?,
                a(4)?,
                args[5],
                args[6],
                a(7)?,
                a(8)?,
            )?,
            WasiAPIName::PROC_EXIT => self.proc_exit(a(0)?)?,
            WasiAPIName::RANDOM_GET => self.random_get(memory_ref, a(0)?, a(1)?)?,
        };
        Ok(status.into())
    }
}

/// Details the arguments expected by the module's entry point, if any is found.
#[cfg(feature = "std")]
pub(crate) enum EntrySignature {
    /// The expected entry point (e.g. "_start") is not found in the WASM module
    /// or it was found and it did not have a recognisable type signature.
    NoEntryFound,
    /// The entry point does not expect any parameters.
    NoParameters,
    /// The entry point expects a dummy `argv` and an `argc` to be supplied.
    ArgvAndArgc,
}

////////////////////////////////////////////////////////////////////////////////
// The strategy trait.
////////////////////////////////////////////////////////////////////////////////

/// This is what an execution strategy exposes to clients outside of this
/// library.  This functionality is sufficient to implement
/// `freestanding-wasi-shim`, and if any functionality is missing that it
/// requires then it should be added to this trait.
///
/// Note that the top-level function `execute` in this crate relies on this trait.
pub trait ExecutionEngine: Send {
    /// Invokes the entry point of the WASM program `program`.  Will fail if
    /// the WASM program fails at runtime.  On success, returns the exit code
    /// of the program.
    fn invoke_entry_point(&mut self, program: Vec<u8>) -> Result<u32>;
}
