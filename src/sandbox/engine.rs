use tracing::{debug, trace};
use wasmtime::{Linker, Memory, Store, StoreLimitsBuilder, Trap, TypedFunc};

use crate::constants::{GUEST_ALLOCATE, GUEST_RECOVER};
use crate::resolution::Resolution;
use crate::sandbox::bridge::{self, BridgeState};
use crate::sandbox::module::GuestModule;
use crate::sandbox::{RecoveryEngine, SandboxError};

/// A single sandbox instance holding two guest buffers of `image_len` bytes.
pub struct WasmEngine {
    store: Store<BridgeState>,
    memory: Memory,
    allocate_fn: TypedFunc<u32, u32>,
    recover_fn: TypedFunc<(u32, u32, u32, u32, u32), i32>,
    resolution: Resolution,
    image_len: u32,
    input_ptr: u32,
    output_ptr: u32,
}

fn guest_error(err: wasmtime::Error) -> SandboxError {
    if err.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
        SandboxError::Interrupted
    } else {
        SandboxError::Guest(format!("{err:#}"))
    }
}

impl WasmEngine {
    pub fn create(module: &GuestModule, resolution: Resolution) -> Result<Self, SandboxError> {
        let image_len = resolution
            .image_len()
            .ok_or(SandboxError::BufferSize(resolution))?;

        let mut limits = StoreLimitsBuilder::new().trap_on_grow_failure(true);
        if let Some(max) = module.max_memory_bytes() {
            limits = limits.memory_size(max);
        }
        let mut store = Store::new(module.engine(), BridgeState::new(limits.build()));
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);

        let mut linker = Linker::new(module.engine());
        bridge::link_host_bridge(&mut linker, module.memory_export().clone())
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;
        let instance = linker
            .instantiate(&mut store, module.module())
            .map_err(|e| match guest_error(e) {
                SandboxError::Guest(msg) => SandboxError::Instantiate(msg),
                other => other,
            })?;

        let memory = instance
            .get_memory(&mut store, module.memory_export())
            .ok_or_else(|| SandboxError::MissingExport(format!("memory {:?}", module.memory_export())))?;
        let allocate_fn = instance
            .get_typed_func::<u32, u32>(&mut store, GUEST_ALLOCATE)
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;
        let recover_fn = instance
            .get_typed_func::<(u32, u32, u32, u32, u32), i32>(&mut store, GUEST_RECOVER)
            .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;

        let mut engine = Self {
            store,
            memory,
            allocate_fn,
            recover_fn,
            resolution,
            image_len,
            input_ptr: 0,
            output_ptr: 0,
        };
        engine.input_ptr = engine.allocate(image_len)?;
        engine.output_ptr = engine.allocate(image_len)?;
        trace!(
            "sandbox ready for {resolution}: input={:#x} output={:#x} len={image_len}",
            engine.input_ptr, engine.output_ptr
        );
        Ok(engine)
    }

    pub fn guest_memory_bytes(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Number of (grow, copy) bridge calls the guest has made so far.
    pub fn bridge_calls(&self) -> (u32, u32) {
        let state = self.store.data();
        (state.grow_calls, state.copy_calls)
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<(), SandboxError> {
        let start = offset as usize;
        let end = start.checked_add(len as usize);
        match end {
            Some(end) if end <= self.guest_memory_bytes() => Ok(()),
            _ => Err(SandboxError::MemoryAccess {
                offset: start,
                len: len as usize,
            }),
        }
    }
}

impl RecoveryEngine for WasmEngine {
    fn image_len(&self) -> usize {
        self.image_len as usize
    }

    fn allocate(&mut self, size: u32) -> Result<u32, SandboxError> {
        let ptr = self
            .allocate_fn
            .call(&mut self.store, size)
            .map_err(|err| match guest_error(err) {
                SandboxError::Guest(reason) => SandboxError::Allocation { size, reason },
                other => other,
            })?;
        if ptr == 0 {
            return Err(SandboxError::Allocation {
                size,
                reason: "guest returned a null pointer".to_string(),
            });
        }
        self.check_range(ptr, size).map_err(|_| SandboxError::Allocation {
            size,
            reason: format!("pointer {ptr:#x} lies outside guest memory"),
        })?;
        Ok(ptr)
    }

    fn recover(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, SandboxError> {
        let capacity = self.image_len as usize;
        if input.len() > capacity {
            return Err(SandboxError::InputTooLarge {
                len: input.len(),
                capacity,
            });
        }
        // Bounded by image_len, which fits in u32.
        let input_len = input.len() as u32;

        self.memory
            .write(&mut self.store, self.input_ptr as usize, input)
            .map_err(|_| SandboxError::MemoryAccess {
                offset: self.input_ptr as usize,
                len: input.len(),
            })?;

        let code = self
            .recover_fn
            .call(
                &mut self.store,
                (
                    self.input_ptr,
                    input_len,
                    self.output_ptr,
                    self.resolution.width,
                    self.resolution.height,
                ),
            )
            .map_err(guest_error)?;
        if code < 0 {
            trace!("guest reported nothing to recover (code {code})");
            return Ok(None);
        }

        self.check_range(self.output_ptr, self.image_len)?;
        let start = self.output_ptr as usize;
        let end = start + capacity;
        let output = self.memory.data(&self.store)[start..end].to_vec();
        Ok(Some(output))
    }

    fn close(self: Box<Self>) {
        let (grows, copies) = self.bridge_calls();
        debug!(
            "closing sandbox: memory={} bytes grows={grows} copies={copies}",
            self.guest_memory_bytes()
        );
    }
}
