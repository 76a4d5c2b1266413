//! Shared constants for the pipeline and the guest ABI.

/// Link channel capacity per worker.
pub const CHANNEL_CAPACITY_MULTIPLIER: usize = 4;
pub const MIN_CHANNEL_CAPACITY: usize = 16;

/// Bytes fetched up front to decide whether a link is worth downloading.
pub const HEADER_PEEK_LEN: usize = 24;

pub const WASM_PAGE_SIZE: u64 = 64 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Import module the guest expects its host functions under.
pub const HOST_MODULE: &str = "a";
/// `a.a(requested_total_bytes) -> i32`
pub const HOST_GROW: &str = "a";
/// `a.b(dest, src, len)`
pub const HOST_COPY: &str = "b";

/// `f(size) -> ptr`
pub const GUEST_ALLOCATE: &str = "f";
/// `e(input_ptr, input_len, output_ptr, width, height) -> i32`
pub const GUEST_RECOVER: &str = "e";

pub const RECOVERED_SUFFIX: &str = "-recovered";
pub const OUTPUT_EXTENSION: &str = "png";

/// How often the coordinator checks the cancel flag between progress ticks.
pub const CANCEL_POLL_INTERVAL_MS: u64 = 100;
