//! An implementation of the ExecutionEngine runtime state for Wasmtime.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

#![allow(clippy::too_many_arguments)]

use crate::{
    abi::ErrNo,
    engines::common::{
        EntrySignature, ExecutionEngine, FatalShimError, HostResult, WasiAPIName, WasiShim,
    },
    memory::{checked_range, MemoryHandler},
};
use anyhow::{anyhow, Result};
use log::info;
use std::{
    convert::TryFrom,
    sync::{Arc, Mutex},
    vec::Vec,
};
use wasmtime::{Caller, Config, Engine, ExternType, Linker, Memory, Module, Store, ValType};

////////////////////////////////////////////////////////////////////////////////
// The Wasmtime runtime state.
////////////////////////////////////////////////////////////////////////////////

type SharedMutableWasiShim = Arc<Mutex<WasiShim>>;
type CallerWrapper<'a> = Caller<'a, SharedMutableWasiShim>;

/// A macro to call try_from on a untyped raw wasi parameter `$var`.
/// It converts `$var` to the typed version, `$t`, of the parameter as a value,
/// or returns from the function with the `Inval` error code.
macro_rules! convert_wasi_arg {
    ($var:ident, $t:ty) => {
        match <$t>::try_from($var) {
            Err(_) => return Ok(ErrNo::Inval.into()),
            Ok(o) => o,
        }
    };
}

/// The guest's linear memory, looked up from the caller on every host call.
/// `memory` is `None` if the module does not export one.
pub struct WasmtimeMemory<'a, 'b> {
    caller: &'a mut CallerWrapper<'b>,
    memory: Option<Memory>,
}

impl<'a, 'b> WasmtimeMemory<'a, 'b> {
    fn new(caller: &'a mut CallerWrapper<'b>) -> Self {
        let memory = caller
            .get_export(WasiShim::LINEAR_MEMORY_NAME)
            .and_then(|export| export.into_memory());
        Self { caller, memory }
    }

    fn memory(&self) -> HostResult<Memory> {
        self.memory
            .ok_or_else(|| FatalShimError::NoMemoryRegistered.into())
    }
}

impl MemoryHandler for WasmtimeMemory<'_, '_> {
    fn get_slice(&self, address: u32, length: u32) -> HostResult<&[u8]> {
        let data = self.memory()?.data(&*self.caller);
        let range = checked_range(address, length, data.len())?;
        Ok(&data[range])
    }

    fn get_slice_mut(&mut self, address: u32, length: u32) -> HostResult<&mut [u8]> {
        let data = self.memory()?.data_mut(&mut *self.caller);
        let range = checked_range(address, length, data.len())?;
        Ok(&mut data[range])
    }

    fn get_size(&self) -> HostResult<u32> {
        let size = self.memory()?.data_size(&*self.caller);
        Ok(u32::try_from(size).map_err(|_| ErrNo::Overflow)?)
    }

    /// Calls the guest's exported allocator.  A null result is `NoMem`.
    fn allocate(&mut self, size: u32) -> HostResult<u32> {
        let malloc = self
            .caller
            .get_export(WasiShim::ALLOCATOR_NAME)
            .and_then(|export| export.into_func())
            .ok_or(FatalShimError::NoAllocatorRegistered)?
            .typed::<u32, u32>(&*self.caller)
            .map_err(|e| FatalShimError::AllocatorFailed(e.to_string()))?;
        match malloc.call(&mut *self.caller, size) {
            Ok(0) => Err(ErrNo::NoMem.into()),
            Ok(address) => Ok(address),
            Err(e) => Err(FatalShimError::AllocatorFailed(e.to_string()).into()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Checking function well-formedness.
////////////////////////////////////////////////////////////////////////////////

/// Checks whether `main` was declared with `argc` and `argv` or without in the
/// WASM program.
fn check_main(tau: &ExternType) -> EntrySignature {
    match tau {
        ExternType::Func(tau) => {
            let params: Vec<ValType> = tau.params().collect();
            if params == [ValType::I32, ValType::I32] {
                EntrySignature::ArgvAndArgc
            } else if params.is_empty() {
                EntrySignature::NoParameters
            } else {
                EntrySignature::NoEntryFound
            }
        }
        _otherwise => EntrySignature::NoEntryFound,
    }
}

////////////////////////////////////////////////////////////////////////////////
// The Wasmtime host provisioning state.
////////////////////////////////////////////////////////////////////////////////

/// The facade of the Wasmtime host state.
pub struct WasmtimeRuntimeState {
    /// The shim, shared with every host call through the store.
    shim: SharedMutableWasiShim,
}

impl WasmtimeRuntimeState {
    pub fn new(shim: WasiShim) -> Self {
        Self {
            shim: Arc::new(Mutex::new(shim)),
        }
    }

    /// Executes the entry point of the WASM program.
    ///
    /// Returns an error if the program is invalid, has no entry point, or
    /// traps before calling `proc_exit`.  A trap after `proc_exit` (the usual
    /// way a guest stops) yields the recorded exit code.  A program that
    /// returns from its entry point without calling `proc_exit` exits with 0.
    pub(crate) fn invoke_engine(&self, binary: Vec<u8>) -> Result<u32> {
        let engine = Engine::new(&Config::default())?;
        let module = Module::new(&engine, binary)?;
        let mut linker = Linker::new(&engine);

        info!("Initialized Wasmtime engine.");

        let wasi_scope = WasiShim::WASI_SNAPSHOT_MODULE_NAME;
        linker.func_wrap(wasi_scope, WasiAPIName::ARGS_GET.into(), Self::wasi_arg_get)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ARGS_SIZES_GET.into(),
            Self::wasi_args_sizes_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ENVIRON_GET.into(),
            Self::wasi_environ_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ENVIRON_SIZES_GET.into(),
            Self::wasi_environ_size_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::CLOCK_RES_GET.into(),
            Self::wasi_clock_res_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::CLOCK_TIME_GET.into(),
            Self::wasi_clock_time_get,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_CLOSE.into(), Self::wasi_fd_close)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_FDSTAT_GET.into(),
            Self::wasi_fd_fdstat_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_FDSTAT_SET_FLAGS.into(),
            Self::wasi_fd_fdstat_set_flags,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_PRESTAT_GET.into(),
            Self::wasi_fd_prestat_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_PRESTAT_DIR_NAME.into(),
            Self::wasi_fd_prestat_dir_name,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_READ.into(), Self::wasi_fd_read)?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_SEEK.into(), Self::wasi_fd_seek)?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_WRITE.into(), Self::wasi_fd_write)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::PATH_FILESTAT_GET.into(),
            Self::wasi_path_filestat_get,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::PATH_OPEN.into(), Self::wasi_path_open)?;
        linker.func_wrap(wasi_scope, WasiAPIName::PROC_EXIT.into(), Self::wasi_proc_exit)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::RANDOM_GET.into(),
            Self::wasi_random_get,
        )?;
        // Anything else the guest imports traps when called.
        linker.define_unknown_imports_as_traps(&module)?;

        info!("Link external functions.");

        let mut store = Store::new(&engine, self.shim.clone());
        let instance = linker.instantiate(&mut store, &module)?;

        info!("Linker instantiates.");

        let export = instance
            .get_export(&mut store, WasiShim::ENTRY_POINT_NAME)
            .ok_or(FatalShimError::NoProgramEntryPoint)?;

        info!("Get the main function.");

        let return_from_main = match check_main(&export.ty(&store)) {
            EntrySignature::ArgvAndArgc => instance
                .get_typed_func::<(i32, i32), ()>(&mut store, WasiShim::ENTRY_POINT_NAME)?
                .call(&mut store, (0, 0)),
            EntrySignature::NoParameters => instance
                .get_typed_func::<(), ()>(&mut store, WasiShim::ENTRY_POINT_NAME)?
                .call(&mut store, ()),
            EntrySignature::NoEntryFound => {
                return Err(anyhow!(FatalShimError::NoProgramEntryPoint))
            }
        };

        info!("Execution returns.");

        // A trap after `proc_exit` is how the guest stops; the exit code
        // takes precedence over it.
        let exit_code = store
            .into_data()
            .lock()
            .map_err(|_| anyhow!(FatalShimError::FailedToObtainLock))?
            .exit_code();
        info!("Exit code {:?}", exit_code);
        match exit_code {
            Some(e) => Ok(e),
            None => {
                info!(
                    "The return trace: {:?}, (`proc_exit` is not called).",
                    return_from_main
                );
                return_from_main?;
                Ok(0)
            }
        }
    }

    /// Locks the shim, resolves the caller's memory and runs `call`.  Fatal
    /// errors become traps.
    fn host_call<F>(caller: &mut CallerWrapper<'_>, call: F) -> Result<u32>
    where
        F: FnOnce(&mut WasiShim, &mut WasmtimeMemory) -> std::result::Result<u32, FatalShimError>,
    {
        let shared = caller.data().clone();
        let mut shim = shared
            .lock()
            .map_err(|_| anyhow!(FatalShimError::FailedToObtainLock))?;
        let mut memory = WasmtimeMemory::new(caller);
        call(&mut *shim, &mut memory).map_err(|e| anyhow!(e))
    }

    fn wasi_arg_get(
        mut caller: CallerWrapper<'_>,
        string_ptr_address: u32,
        buf_address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.args_get(memory, string_ptr_address, buf_address)
        })
    }

    fn wasi_args_sizes_get(
        mut caller: CallerWrapper<'_>,
        count_address: u32,
        size_address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.args_sizes_get(memory, count_address, size_address)
        })
    }

    fn wasi_environ_get(
        mut caller: CallerWrapper<'_>,
        string_ptr_address: u32,
        buf_address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.environ_get(memory, string_ptr_address, buf_address)
        })
    }

    fn wasi_environ_size_get(
        mut caller: CallerWrapper<'_>,
        count_address: u32,
        size_address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.environ_sizes_get(memory, count_address, size_address)
        })
    }

    fn wasi_clock_res_get(mut caller: CallerWrapper<'_>, clock_id: u32, address: u32) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.clock_res_get_into(memory, clock_id, address)
        })
    }

    fn wasi_clock_time_get(
        mut caller: CallerWrapper<'_>,
        clock_id: u32,
        precision: u64,
        address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.clock_time_get(memory, clock_id, precision, address)
        })
    }

    fn wasi_fd_close(mut caller: CallerWrapper<'_>, fd: u32) -> Result<u32> {
        Self::host_call(&mut caller, |shim, _| shim.fd_close(fd))
    }

    fn wasi_fd_fdstat_get(mut caller: CallerWrapper<'_>, fd: u32, address: u32) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_fdstat_get(memory, fd, address)
        })
    }

    fn wasi_fd_fdstat_set_flags(mut caller: CallerWrapper<'_>, fd: u32, flags: u32) -> Result<u32> {
        let flags = convert_wasi_arg!(flags, u16);
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_fdstat_set_flags(memory, fd, flags.into())
        })
    }

    fn wasi_fd_prestat_get(mut caller: CallerWrapper<'_>, fd: u32, address: u32) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_prestat_get(memory, fd, address)
        })
    }

    fn wasi_fd_prestat_dir_name(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        address: u32,
        size: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_prestat_dir_name(memory, fd, address, size)
        })
    }

    fn wasi_fd_read(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_read(memory, fd, iovec_base, iovec_count, address)
        })
    }

    fn wasi_fd_seek(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        offset: i64,
        whence: u32,
        address: u32,
    ) -> Result<u32> {
        let whence = convert_wasi_arg!(whence, u8);
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_seek(memory, fd, offset, whence.into(), address)
        })
    }

    fn wasi_fd_write(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.fd_write(memory, fd, iovec_base, iovec_count, address)
        })
    }

    fn wasi_path_filestat_get(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        flags: u32,
        path_address: u32,
        path_length: u32,
        address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.path_filestat_get(memory, fd, flags, path_address, path_length, address)
        })
    }

    fn wasi_path_open(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        dir_flags: u32,
        path_address: u32,
        path_length: u32,
        oflags: u32,
        rights_base: u64,
        rights_inheriting: u64,
        fd_flags: u32,
        address: u32,
    ) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.path_open(
                memory,
                fd,
                dir_flags,
                path_address,
                path_length,
                oflags,
                rights_base,
                rights_inheriting,
                fd_flags,
                address,
            )
        })
    }

    fn wasi_proc_exit(mut caller: CallerWrapper<'_>, exit_code: u32) -> Result<()> {
        Self::host_call(&mut caller, |shim, _| shim.proc_exit(exit_code))?;
        Ok(())
    }

    fn wasi_random_get(mut caller: CallerWrapper<'_>, address: u32, length: u32) -> Result<u32> {
        Self::host_call(&mut caller, |shim, memory| {
            shim.random_get(memory, address, length)
        })
    }
}

/// The `WasmtimeRuntimeState` implements everything needed to create a
/// compliant instance of `ExecutionEngine`.
impl ExecutionEngine for WasmtimeRuntimeState {
    /// Executes the entry point of the WASM program provisioned into the
    /// shim.
    #[inline]
    fn invoke_entry_point(&mut self, program: Vec<u8>) -> Result<u32> {
        self.invoke_engine(program)
    }
}
