mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use cropsalvage::error_log::MemoryErrorLog;
use cropsalvage::pipeline;
use cropsalvage::resolution::Resolution;
use cropsalvage::sandbox::GuestModule;

use common::{
    ECHO_GUEST, MapFetcher, SharedLog, clean_png, export_archive, file_names, messages_csv, run_config,
    truncated_png,
};

fn run_with_workers(workers: usize) -> (Vec<String>, BTreeSet<String>, u64) {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let out_dir = temp_dir.path().join("download");

    let mut fetcher = MapFetcher::new();
    let mut rows = Vec::new();
    for idx in 0..40 {
        let link = format!("https://cdn.test/img/{idx}.png");
        fetcher = match idx % 4 {
            0 => fetcher.with(&link, clean_png(20, 20)),
            1 => fetcher.with(&link, truncated_png(200, 20)),
            3 if idx % 8 == 3 => fetcher,
            _ => fetcher.with(&link, truncated_png(30, 30)),
        };
        rows.push(link);
    }
    let row_refs: Vec<(&str, &str)> = rows.iter().map(|link| ("", link.as_str())).collect();
    let archive = export_archive(&[
        ("messages/c1/messages.csv", messages_csv(&row_refs[..20])),
        ("messages/c2/messages.csv", messages_csv(&row_refs[20..])),
    ]);

    let fetcher = Arc::new(fetcher);
    let module = GuestModule::compile(ECHO_GUEST.as_bytes()).expect("compile");
    let cfg = run_config(&out_dir, Resolution::new(100, 100).expect("res"), workers);
    let log = Arc::new(MemoryErrorLog::new());

    let stats = pipeline::run_pipeline(
        &cfg,
        archive,
        Arc::new(module),
        fetcher.clone(),
        Box::new(SharedLog(log.clone())),
    )
    .expect("pipeline");
    assert_eq!(stats.links_processed, 40);

    let opened: BTreeSet<String> = fetcher.opened().into_iter().collect();
    assert_eq!(opened.len(), 40, "every link delivered exactly once");
    assert_eq!(fetcher.opens(), 40);
    let mut failures = log.lines();
    failures.sort();
    (file_names(&out_dir), failures.into_iter().collect(), stats.recovered)
}

#[test]
fn results_do_not_depend_on_worker_count() {
    let (files_1, failures_1, recovered_1) = run_with_workers(1);
    // 10 clean, 10 out of bounds, 5 missing, 15 recovered.
    assert_eq!(recovered_1, 15);
    assert_eq!(files_1.len(), 30);
    assert_eq!(failures_1.len(), 5);

    for workers in [4, 64] {
        let (files, failures, recovered) = run_with_workers(workers);
        assert_eq!(files, files_1, "file set differs with {workers} workers");
        assert_eq!(failures, failures_1, "failures differ with {workers} workers");
        assert_eq!(recovered, recovered_1);
    }
}
