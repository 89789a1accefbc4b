use anyhow::{Context, Result};
use chrono::Utc;
use lcscraper::{
    config::Config,
    countries::load_targets,
    fetch::PageFetcher,
    run::{Orchestrator, RunState},
    write::OutputWriter,
};
use std::{env, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lcscraper=info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) load config ──────────────────────────────────────────────
    let config_path: Option<PathBuf> = env::args()
        .nth(1)
        .or_else(|| env::var("LCSCRAPER_CONFIG").ok())
        .map(PathBuf::from);
    let cfg = Config::load(config_path.as_deref())?;
    info!(
        config = ?config_path,
        workers = cfg.fetch.worker_count(),
        delay_ms = cfg.fetch.delay_ms,
        "config loaded"
    );

    // ─── 3) load country mapping (fatal on failure) ──────────────────
    let targets = load_targets(&cfg.input).context("loading country mapping")?;

    // ─── 4) build fetcher + orchestrator ─────────────────────────────
    let fetcher = PageFetcher::new(&cfg.fetch)?;
    let orchestrator = Orchestrator::from_config(fetcher, &cfg)?;

    // ─── 5) ctrl-c stops the run between countries ───────────────────
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current countries");
            cancel.cancel();
        }
    });

    // ─── 6) run ──────────────────────────────────────────────────────
    let output = orchestrator.run(&targets).await?;

    // ─── 7) persist ──────────────────────────────────────────────────
    let written = OutputWriter::new(&cfg.output).write_run(&output, Utc::now())?;
    for path in &written {
        info!(path = %path.display(), "wrote");
    }

    // ─── 8) report ───────────────────────────────────────────────────
    for (target, failure) in output.summary.failures() {
        error!(country_id = target.id, country = %target.name, %failure, "country failed");
    }
    match output.summary.state {
        RunState::Done => info!(records = output.dataset.len(), "all done"),
        state => warn!(
            ?state,
            failed = output.summary.failed,
            skipped = output.summary.skipped,
            records = output.dataset.len(),
            "done with errors"
        ),
    }
    Ok(())
}
