//! # Pipeline Module
//!
//! Orchestrates link extraction, the recovery worker pool and the error log.
//!
//! ```text
//! extractor ──links (bounded, SPMC)──► worker × N ──┐
//!     │                                             ├─ failures (MPSC) ─► error log thread
//!     └──────────── extraction errors ──────────────┘
//! ```

pub mod events;
pub mod workers;

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::config::Config;
use crate::constants::{CANCEL_POLL_INTERVAL_MS, CHANNEL_CAPACITY_MULTIPLIER, MIN_CHANNEL_CAPACITY};
use crate::error_log::ErrorSink;
use crate::extract::{self, ExtractSettings, ExtractStats, ExtractionError, LinkExtractor};
use crate::fetch::LinkFetcher;
use crate::resolution::Resolution;
use crate::sandbox::{EngineFactory, SandboxError};

use events::FailureEvent;
use workers::{WorkerContext, WorkerCounters};

/// Immutable per-run settings handed to the coordinator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub resolution: Resolution,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub extract: ExtractSettings,
    pub abort_on_sandbox_fault: bool,
}

impl RunConfig {
    pub fn new(resolution: Resolution, output_dir: &Path, workers: usize, cfg: &Config) -> Self {
        Self {
            resolution,
            output_dir: output_dir.to_path_buf(),
            workers: workers.max(1),
            extract: ExtractSettings::from_config(cfg),
            abort_on_sandbox_fault: cfg.abort_on_sandbox_fault,
        }
    }
}

/// Pipeline statistics collected during a run
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub entries_read: u64,
    pub rows_read: u64,
    pub links_extracted: u64,
    pub links_processed: u64,
    pub recovered: u64,
    pub already_done: u64,
    pub out_of_bounds: u64,
    pub oversize: u64,
    pub not_recoverable: u64,
    pub failed: u64,
    pub extraction_errors: u64,
    pub errors_logged: u64,
    pub error_log_failures: u64,
    pub cancelled: bool,
    pub elapsed_seconds: f64,
}

/// Progress snapshot reported during a run.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub links_processed: u64,
    pub recovered: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors_logged: u64,
    pub elapsed_seconds: f64,
    pub links_per_second: f64,
    pub cancelled: bool,
}

/// Progress callback trait for long-running runs.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

pub struct ProgressConfig {
    pub reporter: Arc<dyn ProgressReporter>,
    pub interval: Duration,
}

/// Run the recovery pipeline to completion.
pub fn run_pipeline<R>(
    cfg: &RunConfig,
    archive: ZipArchive<R>,
    engines: Arc<dyn EngineFactory>,
    fetcher: Arc<dyn LinkFetcher>,
    error_sink: Box<dyn ErrorSink>,
) -> Result<PipelineStats>
where
    R: Read + Seek + Send + 'static,
{
    PipelineRunner::new(cfg, engines, fetcher, error_sink, None, None).run(archive)
}

/// Run the pipeline with an external cancellation flag (e.g., Ctrl+C).
pub fn run_pipeline_with_cancel<R>(
    cfg: &RunConfig,
    archive: ZipArchive<R>,
    engines: Arc<dyn EngineFactory>,
    fetcher: Arc<dyn LinkFetcher>,
    error_sink: Box<dyn ErrorSink>,
    cancel_flag: Arc<AtomicBool>,
    progress: Option<ProgressConfig>,
) -> Result<PipelineStats>
where
    R: Read + Seek + Send + 'static,
{
    PipelineRunner::new(cfg, engines, fetcher, error_sink, Some(cancel_flag), progress)
        .run(archive)
}

struct PipelineChannels {
    link_tx: Sender<String>,
    link_rx: Receiver<String>,
    failure_tx: Sender<FailureEvent>,
    failure_rx: Receiver<FailureEvent>,
    extraction_tx: Sender<ExtractionError>,
    extraction_rx: Receiver<ExtractionError>,
    done_tx: Sender<()>,
}

struct PipelineCounters {
    workers: Arc<WorkerCounters>,
    errors_logged: Arc<AtomicU64>,
    error_log_failures: Arc<AtomicU64>,
}

impl PipelineCounters {
    fn new() -> Self {
        Self {
            workers: Arc::new(WorkerCounters::default()),
            errors_logged: Arc::new(AtomicU64::new(0)),
            error_log_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    fn snapshot(&self, start: Instant, cancelled: bool) -> ProgressSnapshot {
        let w = &self.workers;
        let processed = w.processed.load(Ordering::Relaxed);
        let elapsed = start.elapsed().as_secs_f64();
        let skipped = w.already_done.load(Ordering::Relaxed)
            + w.out_of_bounds.load(Ordering::Relaxed)
            + w.oversize.load(Ordering::Relaxed)
            + w.not_recoverable.load(Ordering::Relaxed);
        ProgressSnapshot {
            links_processed: processed,
            recovered: w.recovered.load(Ordering::Relaxed),
            skipped,
            failed: w.failed.load(Ordering::Relaxed),
            errors_logged: self.errors_logged.load(Ordering::Relaxed),
            elapsed_seconds: elapsed,
            links_per_second: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            cancelled,
        }
    }
}

struct WorkerHandles {
    extractor: std::thread::JoinHandle<ExtractStats>,
    error_log: std::thread::JoinHandle<()>,
    workers: Vec<std::thread::JoinHandle<Result<(), SandboxError>>>,
}

struct PipelineRunner<'a> {
    cfg: &'a RunConfig,
    engines: Arc<dyn EngineFactory>,
    fetcher: Arc<dyn LinkFetcher>,
    error_sink: Option<Box<dyn ErrorSink>>,
    cancel_flag: Arc<AtomicBool>,
    progress: Option<ProgressConfig>,
}

impl<'a> PipelineRunner<'a> {
    fn new(
        cfg: &'a RunConfig,
        engines: Arc<dyn EngineFactory>,
        fetcher: Arc<dyn LinkFetcher>,
        error_sink: Box<dyn ErrorSink>,
        cancel_flag: Option<Arc<AtomicBool>>,
        progress: Option<ProgressConfig>,
    ) -> Self {
        Self {
            cfg,
            engines,
            fetcher,
            error_sink: Some(error_sink),
            cancel_flag: cancel_flag.unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
            progress,
        }
    }

    fn run<R>(mut self, archive: ZipArchive<R>) -> Result<PipelineStats>
    where
        R: Read + Seek + Send + 'static,
    {
        std::fs::create_dir_all(&self.cfg.output_dir).with_context(|| {
            format!("failed to create output dir {}", self.cfg.output_dir.display())
        })?;
        let extractor = LinkExtractor::new(archive, self.cfg.extract.clone())
            .context("invalid image suffix pattern")?;
        info!(
            "message_logs={} workers={} resolution={}",
            extractor.message_logs().len(),
            self.cfg.workers,
            self.cfg.resolution
        );

        let counters = PipelineCounters::new();
        let error_sink = self
            .error_sink
            .take()
            .ok_or_else(|| anyhow!("error sink already taken"))?;
        let start = Instant::now();
        // Every channel end except `done_rx` moves into a spawned thread: the
        // extractor stops when all link receivers are gone, the coordinator
        // when all done senders are.
        let (channels, done_rx) = self.setup_channels();
        let handles = self.spawn_workers(extractor, error_sink, channels, &counters);

        self.wait_loop(&done_rx, &counters, start);
        self.finalize(handles, counters, start)
    }

    fn setup_channels(&self) -> (PipelineChannels, Receiver<()>) {
        let channel_cap = self
            .cfg
            .workers
            .saturating_mul(CHANNEL_CAPACITY_MULTIPLIER)
            .max(MIN_CHANNEL_CAPACITY);
        let (link_tx, link_rx) = bounded::<String>(channel_cap);
        let (failure_tx, failure_rx) = bounded::<FailureEvent>(channel_cap * 2);
        let (extraction_tx, extraction_rx) = bounded::<ExtractionError>(channel_cap * 2);
        let (done_tx, done_rx) = bounded::<()>(0);

        let channels = PipelineChannels {
            link_tx,
            link_rx,
            failure_tx,
            failure_rx,
            extraction_tx,
            extraction_rx,
            done_tx,
        };
        (channels, done_rx)
    }

    fn spawn_workers<R>(
        &self,
        extractor: LinkExtractor<R>,
        error_sink: Box<dyn ErrorSink>,
        channels: PipelineChannels,
        counters: &PipelineCounters,
    ) -> WorkerHandles
    where
        R: Read + Seek + Send + 'static,
    {
        let error_log = workers::spawn_error_thread(
            error_sink,
            channels.failure_rx,
            channels.extraction_rx,
            counters.errors_logged.clone(),
            counters.error_log_failures.clone(),
        );

        let ctx = Arc::new(WorkerContext {
            resolution: self.cfg.resolution,
            output_dir: self.cfg.output_dir.clone(),
            fetcher: self.fetcher.clone(),
            engines: self.engines.clone(),
            cancel: self.cancel_flag.clone(),
            abort_on_sandbox_fault: self.cfg.abort_on_sandbox_fault,
            counters: counters.workers.clone(),
        });
        let workers = workers::spawn_recovery_workers(
            self.cfg.workers,
            ctx,
            channels.link_rx,
            channels.failure_tx,
            channels.done_tx,
        );

        let extractor = extract::spawn_extractor(
            extractor,
            channels.link_tx,
            channels.extraction_tx,
            Some(self.cancel_flag.clone()),
        );

        WorkerHandles {
            extractor,
            error_log,
            workers,
        }
    }

    /// Block until every worker has exited, reporting progress and relaying
    /// cancellation to running guests.
    fn wait_loop(&self, done_rx: &Receiver<()>, counters: &PipelineCounters, start: Instant) {
        let poll = tick(Duration::from_millis(CANCEL_POLL_INTERVAL_MS));
        let mut interrupted = false;
        let mut last_progress = Instant::now();

        loop {
            select! {
                recv(done_rx) -> _ => break,
                recv(poll) -> _ => {
                    let cancelled = self.cancel_flag.load(Ordering::Relaxed);
                    if cancelled && !interrupted {
                        warn!("cancellation requested; interrupting running guests");
                        self.engines.interrupt();
                        interrupted = true;
                    }
                    if let Some(progress) = &self.progress {
                        if last_progress.elapsed() >= progress.interval {
                            progress
                                .reporter
                                .on_progress(&counters.snapshot(start, cancelled));
                            last_progress = Instant::now();
                        }
                    }
                }
            }
        }
    }

    fn finalize(
        &self,
        handles: WorkerHandles,
        counters: PipelineCounters,
        start: Instant,
    ) -> Result<PipelineStats> {
        let mut fatal = None;
        for handle in handles.workers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    fatal.get_or_insert(anyhow::Error::new(err));
                }
                Err(_) => {
                    fatal.get_or_insert(anyhow!("recovery worker panicked"));
                }
            }
        }
        let extract_stats = handles
            .extractor
            .join()
            .map_err(|_| anyhow!("link extractor panicked"))?;
        handles
            .error_log
            .join()
            .map_err(|_| anyhow!("error log thread panicked"))?;

        let cancelled = self.cancel_flag.load(Ordering::Relaxed);
        if let Some(progress) = &self.progress {
            progress
                .reporter
                .on_progress(&counters.snapshot(start, cancelled));
        }
        if let Some(err) = fatal {
            return Err(err.context("recovery run aborted"));
        }

        let w = &counters.workers;
        let stats = PipelineStats {
            entries_read: extract_stats.entries,
            rows_read: extract_stats.rows,
            links_extracted: extract_stats.links,
            links_processed: w.processed.load(Ordering::Relaxed),
            recovered: w.recovered.load(Ordering::Relaxed),
            already_done: w.already_done.load(Ordering::Relaxed),
            out_of_bounds: w.out_of_bounds.load(Ordering::Relaxed),
            oversize: w.oversize.load(Ordering::Relaxed),
            not_recoverable: w.not_recoverable.load(Ordering::Relaxed),
            failed: w.failed.load(Ordering::Relaxed),
            extraction_errors: extract_stats.errors,
            errors_logged: counters.errors_logged.load(Ordering::Relaxed),
            error_log_failures: counters.error_log_failures.load(Ordering::Relaxed),
            cancelled,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            "run finished links={} processed={} recovered={} failed={} cancelled={}",
            stats.links_extracted, stats.links_processed, stats.recovered, stats.failed, stats.cancelled
        );
        Ok(stats)
    }
}
