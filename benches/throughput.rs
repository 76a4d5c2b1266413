use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use cropsalvage::config;
use cropsalvage::error_log::MemoryErrorLog;
use cropsalvage::extract::{self, ExtractSettings};
use cropsalvage::fetch::{FetchError, LinkFetcher};
use cropsalvage::pipeline::{self, RunConfig};
use cropsalvage::png::PNG_IHDR_PREFIX;
use cropsalvage::resolution::Resolution;
use cropsalvage::sandbox::GuestModule;

const ECHO_GUEST: &str = r#"
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
    (call $copy (local.get $out) (local.get $in) (local.get $len))
    (i32.const 0)))
"#;

struct MemoryFetcher(HashMap<String, Vec<u8>>);

impl LinkFetcher for MemoryFetcher {
    fn open(&self, link: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        self.0
            .get(link)
            .map(|body| Box::new(Cursor::new(body.clone())) as Box<dyn Read + Send>)
            .ok_or(FetchError::Status(404))
    }
}

fn links(count: usize) -> Vec<String> {
    (0..count)
        .map(|idx| format!("https://cdn.test/attachments/{idx}/screenshot.png"))
        .collect()
}

fn export_bytes(links: &[String], logs: usize) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for log in 0..logs {
        writer
            .start_file(format!("messages/c{log}/messages.csv"), SimpleFileOptions::default())
            .expect("start file");
        writer
            .write_all(b"ID,Timestamp,Contents,Attachments\n")
            .expect("header");
        for (idx, link) in links.iter().enumerate().skip(log).step_by(logs) {
            let row = format!("{idx},2023-03-20,look at this {link} ok,{link}\n");
            writer.write_all(row.as_bytes()).expect("row");
        }
    }
    writer.finish().expect("finish").into_inner()
}

fn png_body() -> Vec<u8> {
    let mut body = PNG_IHDR_PREFIX.to_vec();
    body.extend_from_slice(&64u32.to_be_bytes());
    body.extend_from_slice(&64u32.to_be_bytes());
    body.extend_from_slice(&[0x5A; 2048]);
    body
}

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract");
    for count in [1_000usize, 10_000] {
        let bytes = export_bytes(&links(count), 8);
        group.bench_with_input(BenchmarkId::new("links", count), &bytes, |b, bytes| {
            b.iter(|| {
                let archive = ZipArchive::new(Cursor::new(bytes.clone())).expect("archive");
                let streams =
                    extract::extract_links(archive, ExtractSettings::default(), 256).expect("streams");
                let drained = streams.links.iter().count();
                assert_eq!(drained, count * 2);
                streams.handle.join().expect("join");
            });
        });
    }
    group.finish();

    let module = GuestModule::compile(ECHO_GUEST.as_bytes()).expect("compile");
    let loaded = config::load_config(None).expect("config");
    let links = links(200);
    let bytes = export_bytes(&links, 4);
    let body = png_body();
    let fetcher = Arc::new(MemoryFetcher(
        links.iter().map(|l| (l.clone(), body.clone())).collect(),
    ));

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    for workers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::new("recover", workers), &workers, |b, &workers| {
            b.iter(|| {
                let temp_dir = tempfile::tempdir().expect("tempdir");
                let cfg = RunConfig::new(
                    Resolution::new(128, 128).expect("res"),
                    temp_dir.path(),
                    workers,
                    &loaded.config,
                );
                let archive = ZipArchive::new(Cursor::new(bytes.clone())).expect("archive");
                pipeline::run_pipeline(
                    &cfg,
                    archive,
                    Arc::new(module.clone()),
                    fetcher.clone(),
                    Box::new(MemoryErrorLog::new()),
                )
                .expect("pipeline")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_throughput);
criterion_main!(benches);
