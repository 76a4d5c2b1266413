//! # Sandbox
//!
//! Runs the externally supplied recovery routine inside a private wasm
//! linear memory. The pipeline only sees the narrow capability interface in
//! [`RecoveryEngine`] / [`EngineFactory`]; [`GuestModule`] is the wasmtime
//! backed implementation.
//!
//! ```text
//! GuestModule (compiled once, shared)
//!     └─ create() per job ─► WasmEngine
//!                              ├─ Store<BridgeState>  (private linear memory)
//!                              ├─ host bridge: a.a grow, a.b copy
//!                              └─ input / output buffers, image_len each
//! ```

pub mod bridge;
pub mod engine;
pub mod module;

use thiserror::Error;

use crate::resolution::Resolution;

pub use engine::WasmEngine;
pub use module::GuestModule;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile guest module: {0}")]
    Compile(String),
    #[error("guest module does not export {0}")]
    MissingExport(String),
    #[error("failed to instantiate guest module: {0}")]
    Instantiate(String),
    #[error("resolution {0} does not fit the guest address space")]
    BufferSize(Resolution),
    #[error("guest failed to allocate {size} bytes: {reason}")]
    Allocation { size: u32, reason: String },
    #[error("input of {len} bytes exceeds guest buffer of {capacity} bytes")]
    InputTooLarge { len: usize, capacity: usize },
    #[error("guest memory access out of bounds at offset {offset} ({len} bytes)")]
    MemoryAccess { offset: usize, len: usize },
    #[error("guest trapped: {0}")]
    Guest(String),
    #[error("guest call interrupted")]
    Interrupted,
}

/// One private recovery instance, created per job and closed afterwards.
pub trait RecoveryEngine {
    /// Size of each of the two guest buffers.
    fn image_len(&self) -> usize;

    /// Allocate `size` bytes through the guest's own allocator.
    fn allocate(&mut self, size: u32) -> Result<u32, SandboxError>;

    /// `Ok(None)` means the guest found nothing to recover.
    fn recover(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, SandboxError>;

    fn close(self: Box<Self>);
}

/// Builds fresh engines bound to the run's resolution.
pub trait EngineFactory: Send + Sync {
    fn create(&self, resolution: Resolution) -> Result<Box<dyn RecoveryEngine>, SandboxError>;

    /// Abort guest calls that are currently running. Called once on cancellation.
    fn interrupt(&self) {}
}
