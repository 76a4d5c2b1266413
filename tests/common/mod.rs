//! Shared test infrastructure for pipeline and sandbox tests.
//!
//! Builds in-memory export archives, serves PNG bodies from a map instead of
//! the network, and provides a small WAT guest that speaks the recovery ABI.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use cropsalvage::config;
use cropsalvage::error_log::{ErrorLogError, ErrorSink, MemoryErrorLog};
use cropsalvage::fetch::{FetchError, LinkFetcher};
use cropsalvage::pipeline::RunConfig;
use cropsalvage::pipeline::events::FailureEvent;
use cropsalvage::png::PNG_IHDR_PREFIX;
use cropsalvage::resolution::Resolution;

// ============================================================================
// Guest modules
// ============================================================================

/// Bump allocator on `f`, and `e` copies the input into the output buffer
/// unless the last input byte is zero (nothing to recover).
pub const ECHO_GUEST: &str = r#"
(module
  (import "a" "a" (func $grow (param i32) (result i32)))
  (import "a" "b" (func $copy (param i32 i32 i32)))
  (memory (export "c") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "f") (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr (global.get $heap))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
      (then (drop (call $grow (local.get $end)))))
    (global.set $heap (local.get $end))
    (local.get $ptr))
  (func (export "e") (param $in i32) (param $len i32) (param $out i32) (param $w i32) (param $h i32) (result i32)
    (if (i32.eqz (i32.load8_u (i32.sub (i32.add (local.get $in) (local.get $len)) (i32.const 1))))
      (then (return (i32.const -1))))
    (call $copy (local.get $out) (local.get $in) (local.get $len))
    (i32.const 0)))
"#;

/// Same allocator, but `e` asks the host to copy from outside linear memory.
pub const OUT_OF_BOUNDS_GUEST: &str = r#"
(module
  (import "a" "a" (func $grow (param i32) (result i32)))
  (import "a" "b" (func $copy (param i32 i32 i32)))
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "f") (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr (global.get $heap))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
      (then (drop (call $grow (local.get $end)))))
    (global.set $heap (local.get $end))
    (local.get $ptr))
  (func (export "e") (param $in i32) (param $len i32) (param $out i32) (param $w i32) (param $h i32) (result i32)
    (call $copy (local.get $out) (i32.const 0xFFFF0000) (local.get $len))
    (i32.const 0)))
"#;

/// `e` never returns.
pub const SPINNING_GUEST: &str = r#"
(module
  (import "a" "a" (func $grow (param i32) (result i32)))
  (import "a" "b" (func $copy (param i32 i32 i32)))
  (memory (export "c") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "f") (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local.set $ptr (global.get $heap))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (if (i32.gt_u (local.get $end) (i32.mul (memory.size) (i32.const 65536)))
      (then (drop (call $grow (local.get $end)))))
    (global.set $heap (local.get $end))
    (local.get $ptr))
  (func (export "e") (param $in i32) (param $len i32) (param $out i32) (param $w i32) (param $h i32) (result i32)
    (loop $forever (br $forever))
    (i32.const 0)))
"#;

/// `f` never returns, so sandbox construction hangs until interrupted.
pub const SPINNING_ALLOCATOR_GUEST: &str = r#"
(module
  (import "a" "a" (func $grow (param i32) (result i32)))
  (import "a" "b" (func $copy (param i32 i32 i32)))
  (memory (export "c") 1)
  (func (export "f") (param $size i32) (result i32)
    (loop $forever (br $forever))
    (i32.const 1024))
  (func (export "e") (param $in i32) (param $len i32) (param $out i32) (param $w i32) (param $h i32) (result i32)
    (i32.const -1)))
"#;

// ============================================================================
// Images and archives
// ============================================================================

/// A PNG signature and IHDR for `width` x `height`, followed by `tail`.
pub fn png_bytes(width: u32, height: u32, tail: &[u8]) -> Vec<u8> {
    let mut bytes = PNG_IHDR_PREFIX.to_vec();
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(tail);
    bytes
}

/// A PNG body the echo guest recovers (last byte non-zero).
pub fn truncated_png(width: u32, height: u32) -> Vec<u8> {
    png_bytes(width, height, b"IDAT-trailing-bytes\x01")
}

/// A PNG body the echo guest declines (last byte zero).
pub fn clean_png(width: u32, height: u32) -> Vec<u8> {
    png_bytes(width, height, b"IEND\x00")
}

pub const CSV_HEADER: &str = "ID,Timestamp,Contents,Attachments\n";

/// One message-log body with a header row and the given rows.
pub fn messages_csv(rows: &[(&str, &str)]) -> String {
    let mut body = CSV_HEADER.to_string();
    for (idx, (content, attachments)) in rows.iter().enumerate() {
        body.push_str(&format!("{idx},2023-03-20 10:00:00,{content},{attachments}\n"));
    }
    body
}

pub fn export_archive(entries: &[(&str, String)]) -> ZipArchive<Cursor<Vec<u8>>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start file");
        writer.write_all(body.as_bytes()).expect("write entry");
    }
    let cursor = writer.finish().expect("finish archive");
    ZipArchive::new(Cursor::new(cursor.into_inner())).expect("open archive")
}

// ============================================================================
// Fetching
// ============================================================================

/// Serves bodies from memory and counts every open.
#[derive(Default)]
pub struct MapFetcher {
    bodies: HashMap<String, Vec<u8>>,
    opens: AtomicU64,
    opened: Mutex<Vec<String>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, link: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(link.to_string(), body);
        self
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl LinkFetcher for MapFetcher {
    fn open(&self, link: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(link.to_string());
        }
        match self.bodies.get(link) {
            Some(body) => Ok(Box::new(Cursor::new(body.clone()))),
            None => Err(FetchError::Status(404)),
        }
    }
}

// ============================================================================
// Run helpers
// ============================================================================

pub fn run_config(output_dir: &Path, resolution: Resolution, workers: usize) -> RunConfig {
    let loaded = config::load_config(None).expect("config");
    RunConfig::new(resolution, output_dir, workers, &loaded.config)
}

/// Sorted file names in `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

/// Lets a test keep reading a memory log after handing it to the pipeline.
pub struct SharedLog(pub Arc<MemoryErrorLog>);

impl ErrorSink for SharedLog {
    fn record(&self, event: &FailureEvent) -> Result<(), ErrorLogError> {
        self.0.record(event)
    }

    fn flush(&self) -> Result<(), ErrorLogError> {
        self.0.flush()
    }
}
