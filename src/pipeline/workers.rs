//! # Pipeline Workers
//!
//! Worker thread spawning for the recovery pipeline: the error log thread and
//! the pool of recovery workers.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, warn};

use crate::constants::HEADER_PEEK_LEN;
use crate::dedup::OutputPaths;
use crate::error_log::ErrorSink;
use crate::extract::ExtractionError;
use crate::fetch::{CancellableReader, FetchError, LinkFetcher};
use crate::png;
use crate::resolution::Resolution;
use crate::sandbox::{EngineFactory, RecoveryEngine, SandboxError};

use super::events::{FailureEvent, LinkError};

/// How a link that did not fail ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Recovered,
    AlreadyDone,
    /// Declared dimensions exceed the run's bound.
    OutOfBounds,
    /// Body larger than the guest input buffer.
    Oversize,
    NotRecoverable,
}

#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub processed: AtomicU64,
    pub recovered: AtomicU64,
    pub already_done: AtomicU64,
    pub out_of_bounds: AtomicU64,
    pub oversize: AtomicU64,
    pub not_recoverable: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerCounters {
    fn record(&self, outcome: JobOutcome) {
        let counter = match outcome {
            JobOutcome::Recovered => &self.recovered,
            JobOutcome::AlreadyDone => &self.already_done,
            JobOutcome::OutOfBounds => &self.out_of_bounds,
            JobOutcome::Oversize => &self.oversize,
            JobOutcome::NotRecoverable => &self.not_recoverable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a recovery worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub resolution: Resolution,
    pub output_dir: PathBuf,
    pub fetcher: Arc<dyn LinkFetcher>,
    pub engines: Arc<dyn EngineFactory>,
    pub cancel: Arc<AtomicBool>,
    pub abort_on_sandbox_fault: bool,
    pub counters: Arc<WorkerCounters>,
}

impl WorkerContext {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Spawn the error log thread. It drains both failure channels until every
/// sender is gone, then flushes the sink.
pub fn spawn_error_thread(
    sink: Box<dyn ErrorSink>,
    failures: Receiver<FailureEvent>,
    extraction: Receiver<ExtractionError>,
    recorded: Arc<AtomicU64>,
    log_errors: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let record = |event: FailureEvent| {
            recorded.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = sink.record(&event) {
                log_errors.fetch_add(1, Ordering::Relaxed);
                warn!("error log record error: {err}");
            }
        };

        // Once one side disconnects, drain the other to completion.
        loop {
            select! {
                recv(failures) -> msg => match msg {
                    Ok(event) => record(event),
                    Err(_) => {
                        for err in &extraction {
                            record(FailureEvent::Extraction(err));
                        }
                        break;
                    }
                },
                recv(extraction) -> msg => match msg {
                    Ok(err) => record(FailureEvent::Extraction(err)),
                    Err(_) => {
                        for event in &failures {
                            record(event);
                        }
                        break;
                    }
                },
            }
        }

        if let Err(err) = sink.flush() {
            log_errors.fetch_add(1, Ordering::Relaxed);
            warn!("error log flush error: {err}");
        }
    })
}

/// Spawn recovery worker threads. Each holds a `done` sender that is dropped
/// when it exits; the coordinator waits for that channel to disconnect.
pub fn spawn_recovery_workers(
    workers: usize,
    ctx: Arc<WorkerContext>,
    rx: Receiver<String>,
    failure_tx: Sender<FailureEvent>,
    done_tx: Sender<()>,
) -> Vec<thread::JoinHandle<Result<(), SandboxError>>> {
    let mut handles = Vec::new();
    let worker_count = workers.max(1);

    for _ in 0..worker_count {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let failure_tx = failure_tx.clone();
        let done_tx = done_tx.clone();

        handles.push(thread::spawn(move || {
            let result = recovery_loop(&ctx, &rx, &failure_tx);
            drop(done_tx);
            result
        }));
    }

    handles
}

fn recovery_loop(
    ctx: &WorkerContext,
    rx: &Receiver<String>,
    failure_tx: &Sender<FailureEvent>,
) -> Result<(), SandboxError> {
    loop {
        if ctx.cancelled() {
            return Ok(());
        }
        let mut engine = match ctx.engines.create(ctx.resolution) {
            Ok(engine) => engine,
            Err(SandboxError::Interrupted) if ctx.cancelled() => {
                debug!("sandbox construction interrupted by cancellation");
                return Ok(());
            }
            Err(err) => {
                error!("failed to create recovery sandbox: {err}");
                ctx.cancel.store(true, Ordering::Relaxed);
                return Err(err);
            }
        };

        let link = match rx.recv() {
            Ok(link) => link,
            Err(_) => {
                engine.close();
                return Ok(());
            }
        };
        if ctx.cancelled() {
            engine.close();
            return Ok(());
        }

        let result = process_link(ctx, engine.as_mut(), &link);
        engine.close();

        match result {
            Ok(outcome) => ctx.counters.record(outcome),
            Err(LinkError::Fetch(FetchError::Cancelled))
            | Err(LinkError::Sandbox(SandboxError::Interrupted))
                if ctx.cancelled() =>
            {
                debug!("job for {link} dropped on cancellation");
                return Ok(());
            }
            Err(LinkError::Sandbox(err)) if ctx.abort_on_sandbox_fault => {
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("sandbox fault on {link}, aborting run: {err}");
                ctx.cancel.store(true, Ordering::Relaxed);
                return Err(err);
            }
            Err(err) => {
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!("link failed link={link} error={err}");
                if let Err(send_err) = failure_tx.send(FailureEvent::link_failure(link, err)) {
                    warn!("error channel closed while sending failure: {send_err}");
                }
            }
        }
        ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run one link through dedup, header check, download and recovery.
pub fn process_link(
    ctx: &WorkerContext,
    engine: &mut dyn RecoveryEngine,
    link: &str,
) -> Result<JobOutcome, LinkError> {
    let paths = OutputPaths::for_link(&ctx.output_dir, link);
    if paths.is_done() {
        debug!("already recovered link={link} hash={}", paths.hash);
        return Ok(JobOutcome::AlreadyDone);
    }

    let body = ctx.fetcher.open(link)?;
    let mut reader = CancellableReader::new(body, Some(ctx.cancel.clone()));

    let mut header = [0u8; HEADER_PEEK_LEN];
    let filled = read_up_to(&mut reader, &mut header).map_err(FetchError::from_read)?;
    let (width, height) = png::read_dimensions(&header[..filled])?;
    if !ctx.resolution.admits(width, height) {
        debug!(
            "skipping link={link}: {width}x{height} exceeds bound {}",
            ctx.resolution
        );
        return Ok(JobOutcome::OutOfBounds);
    }

    let capacity = engine.image_len();
    let mut data = Vec::with_capacity(capacity.min(1 << 20));
    data.extend_from_slice(&header[..filled]);
    let remaining = (capacity + 1).saturating_sub(filled) as u64;
    (&mut reader)
        .take(remaining)
        .read_to_end(&mut data)
        .map_err(FetchError::from_read)?;
    if data.len() > capacity {
        debug!("skipping link={link}: body exceeds {capacity} bytes");
        return Ok(JobOutcome::Oversize);
    }

    match engine.recover(&data)? {
        None => Ok(JobOutcome::NotRecoverable),
        Some(recovered) => {
            paths
                .persist(&data, &recovered)
                .map_err(LinkError::Persist)?;
            debug!("recovered link={link} hash={}", paths.hash);
            Ok(JobOutcome::Recovered)
        }
    }
}

/// Fill `buf` until it is full or the reader hits EOF.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
