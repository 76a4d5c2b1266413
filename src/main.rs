use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use cropsalvage::error_log::JsonlErrorLog;
use cropsalvage::fetch::HttpFetcher;
use cropsalvage::pipeline::{self, ProgressConfig, RunConfig};
use cropsalvage::sandbox::GuestModule;
use cropsalvage::{cli, config, logging, resolution, util};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let cfg = loaded.config;
    info!("config_hash={}", loaded.config_hash);

    let resolution = resolution::resolve(&cli_opts.device, &cfg.devices)?;
    util::ensure_output_dir(&cli_opts.output)?;

    let fetcher = HttpFetcher::new(Duration::from_secs(cfg.request_timeout_secs))
        .context("failed to build http client")?;
    let module_bytes = util::load_module_bytes(cli_opts.module.as_deref(), &fetcher, &cfg.module_url)?;
    let module = GuestModule::compile(&module_bytes)
        .context("failed to load recovery module")?
        .with_memory_limit_mib(cfg.max_guest_memory_mib);

    let archive = util::open_package(&cli_opts.package)?;
    let error_log = JsonlErrorLog::open(&cli_opts.log)
        .with_context(|| format!("failed to open error log {}", cli_opts.log.display()))?;

    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = cancel_flag.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let run_cfg = RunConfig::new(resolution, &cli_opts.output, cli_opts.threads, &cfg);
    info!(
        "starting package={} device={} resolution={} output={} threads={}",
        cli_opts.package.display(),
        cli_opts.device,
        resolution,
        cli_opts.output.display(),
        run_cfg.workers
    );

    let progress = ProgressConfig {
        reporter: Arc::new(util::LogProgress),
        interval: Duration::from_millis(cfg.progress_interval_ms),
    };
    let stats = pipeline::run_pipeline_with_cancel(
        &run_cfg,
        archive,
        Arc::new(module),
        Arc::new(fetcher),
        Box::new(error_log),
        cancel_flag,
        Some(progress),
    )?;

    if stats.cancelled {
        warn!("run cancelled before every link was processed");
    }
    if stats.errors_logged > 0 {
        info!(
            "{} failures written to {}",
            stats.errors_logged,
            cli_opts.log.display()
        );
    }
    info!(
        "cropsalvage finished links={} recovered={} already_done={} failed={}",
        stats.links_extracted, stats.recovered, stats.already_done, stats.failed
    );
    Ok(())
}
