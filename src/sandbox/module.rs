use std::sync::Arc;

use tracing::debug;
use wasmtime::{Config, Engine, ExternType, Module};

use crate::constants::{GUEST_ALLOCATE, GUEST_RECOVER, MIB};
use crate::resolution::Resolution;
use crate::sandbox::engine::WasmEngine;
use crate::sandbox::{EngineFactory, RecoveryEngine, SandboxError};

/// The recovery module compiled once per run and shared by all workers.
///
/// Cloning is cheap: `Engine` and `Module` are reference counted.
#[derive(Clone)]
pub struct GuestModule {
    engine: Engine,
    module: Module,
    memory_export: Arc<str>,
    max_memory_bytes: Option<usize>,
}

impl GuestModule {
    /// Compile wasm (or wat) bytes and check the exports the bridge relies on.
    pub fn compile(bytes: &[u8]) -> Result<Self, SandboxError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| SandboxError::Compile(format!("{e:#}")))?;
        let module =
            Module::new(&engine, bytes).map_err(|e| SandboxError::Compile(format!("{e:#}")))?;

        let mut memory_export = None;
        let mut has_allocate = false;
        let mut has_recover = false;
        for export in module.exports() {
            match export.ty() {
                ExternType::Memory(_) if memory_export.is_none() => {
                    memory_export = Some(Arc::<str>::from(export.name()));
                }
                ExternType::Func(_) if export.name() == GUEST_ALLOCATE => has_allocate = true,
                ExternType::Func(_) if export.name() == GUEST_RECOVER => has_recover = true,
                _ => {}
            }
        }
        if !has_allocate {
            return Err(SandboxError::MissingExport(format!("function {GUEST_ALLOCATE:?}")));
        }
        if !has_recover {
            return Err(SandboxError::MissingExport(format!("function {GUEST_RECOVER:?}")));
        }
        let memory_export =
            memory_export.ok_or_else(|| SandboxError::MissingExport("a linear memory".to_string()))?;

        debug!("compiled guest module, memory export {memory_export:?}");
        Ok(Self {
            engine,
            module,
            memory_export,
            max_memory_bytes: None,
        })
    }

    /// Cap each sandbox's linear memory. `None` leaves only the wasm32 limit.
    pub fn with_memory_limit_mib(mut self, mib: Option<u64>) -> Self {
        self.max_memory_bytes = mib
            .and_then(|m| m.checked_mul(MIB))
            .and_then(|bytes| usize::try_from(bytes).ok());
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn memory_export(&self) -> &Arc<str> {
        &self.memory_export
    }

    pub fn max_memory_bytes(&self) -> Option<usize> {
        self.max_memory_bytes
    }

    /// Trap every guest call currently running on this module's engine.
    pub fn interrupt(&self) {
        self.engine.increment_epoch();
    }

    pub fn instantiate(&self, resolution: Resolution) -> Result<WasmEngine, SandboxError> {
        WasmEngine::create(self, resolution)
    }
}

impl EngineFactory for GuestModule {
    fn create(&self, resolution: Resolution) -> Result<Box<dyn RecoveryEngine>, SandboxError> {
        Ok(Box::new(self.instantiate(resolution)?))
    }

    fn interrupt(&self) {
        GuestModule::interrupt(self);
    }
}
