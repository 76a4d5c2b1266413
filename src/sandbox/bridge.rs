//! Host functions the guest imports to run its own heap: grow and copy.
//!
//! The closures are registered on a per-sandbox [`Linker`] and only touch the
//! calling instance's memory, so concurrent sandboxes share no host state.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;
use wasmtime::{Caller, Linker, Memory, StoreLimits};

use crate::constants::{HOST_COPY, HOST_GROW, HOST_MODULE, WASM_PAGE_SIZE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("guest has no exported memory named {0:?}")]
    NoMemory(String),
    #[error("failed to grow guest memory from {current} to {requested} bytes: {reason}")]
    GrowFailed {
        current: u64,
        requested: u64,
        reason: String,
    },
    #[error("copy of {len} bytes from {src} to {dest} exceeds guest memory of {size} bytes")]
    OutOfBounds {
        dest: u32,
        src: u32,
        len: u32,
        size: usize,
    },
}

/// Per-store host data.
pub struct BridgeState {
    pub limits: StoreLimits,
    pub grow_calls: u32,
    pub copy_calls: u32,
}

impl BridgeState {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            grow_calls: 0,
            copy_calls: 0,
        }
    }
}

/// Whole pages to add so linear memory reaches `requested` bytes.
pub fn pages_needed(current_bytes: u64, requested_bytes: u64) -> u64 {
    requested_bytes
        .saturating_sub(current_bytes)
        .div_ceil(WASM_PAGE_SIZE)
}

/// memmove inside guest memory with both ranges checked first.
pub fn copy_within_guest(memory: &mut [u8], dest: u32, src: u32, len: u32) -> Result<(), BridgeError> {
    let size = memory.len();
    let out_of_bounds = || BridgeError::OutOfBounds {
        dest,
        src,
        len,
        size,
    };
    let src_start = src as usize;
    let dest_start = dest as usize;
    let src_end = src_start.checked_add(len as usize).ok_or_else(out_of_bounds)?;
    let dest_end = dest_start.checked_add(len as usize).ok_or_else(out_of_bounds)?;
    if src_end > size || dest_end > size {
        return Err(out_of_bounds());
    }
    memory.copy_within(src_start..src_end, dest_start);
    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, BridgeState>, name: &str) -> wasmtime::Result<Memory> {
    caller
        .get_export(name)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| wasmtime::Error::new(BridgeError::NoMemory(name.to_string())))
}

/// Register `a.a` (grow) and `a.b` (copy) for one sandbox.
pub fn link_host_bridge(
    linker: &mut Linker<BridgeState>,
    memory_export: Arc<str>,
) -> wasmtime::Result<()> {
    let grow_export = memory_export.clone();
    linker.func_wrap(
        HOST_MODULE,
        HOST_GROW,
        move |mut caller: Caller<'_, BridgeState>, requested: u32| -> wasmtime::Result<u32> {
            let memory = guest_memory(&mut caller, &grow_export)?;
            let current = memory.data_size(&caller) as u64;
            let requested = u64::from(requested);
            let delta = pages_needed(current, requested);
            if delta > 0 {
                memory.grow(&mut caller, delta).map_err(|err| {
                    wasmtime::Error::new(BridgeError::GrowFailed {
                        current,
                        requested,
                        reason: format!("{err:#}"),
                    })
                })?;
            }
            trace!("guest heap grow requested={requested} delta_pages={delta}");
            caller.data_mut().grow_calls += 1;
            Ok(1)
        },
    )?;

    let copy_export = memory_export;
    linker.func_wrap(
        HOST_MODULE,
        HOST_COPY,
        move |mut caller: Caller<'_, BridgeState>, dest: u32, src: u32, len: u32| -> wasmtime::Result<()> {
            let memory = guest_memory(&mut caller, &copy_export)?;
            copy_within_guest(memory.data_mut(&mut caller), dest, src, len)
                .map_err(wasmtime::Error::new)?;
            caller.data_mut().copy_calls += 1;
            Ok(())
        },
    )?;

    Ok(())
}
