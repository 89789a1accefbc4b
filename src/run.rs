// src/run.rs

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{Config, FetchConfig},
    countries::CountryTarget,
    error::{FetchFailure, RunError},
    extract::TableExtractor,
    fetch::{FetchStatus, PageSource, Paced, RawPage},
    process::{aggregate, GroupedView, NormalizeStats, Normalizer},
    record::{Dataset, LcRecord},
};

/// Per-country progress: `Pending → Fetching → Extracting → Accumulated`,
/// or `Failed` after a fetch failure, or `Skipped` when the run was cancelled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CountryState {
    Pending,
    Fetching,
    Extracting,
    Accumulated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Aggregating,
    Normalizing,
    Done,
    DoneWithErrors,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountryStats {
    pub records: usize,
    pub tables_found: usize,
    pub skipped_rows: usize,
}

/// Outcome of one country: records, a failure with its reason, or never tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CountryOutcome {
    Extracted(CountryStats),
    Failed(FetchFailure),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryReport {
    pub target: CountryTarget,
    pub state: CountryState,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: CountryOutcome,
}

impl CountryReport {
    fn pending(target: CountryTarget) -> Self {
        Self {
            target,
            state: CountryState::Pending,
            attempts: 0,
            outcome: CountryOutcome::Skipped,
        }
    }

    fn skipped(target: CountryTarget) -> Self {
        Self {
            state: CountryState::Skipped,
            ..Self::pending(target)
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, CountryOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRecord {
    pub country_id: Option<u32>,
    pub reason: String,
}

/// What a run did, country by country. Serialized as the run's JSON summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub countries: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_extracted: usize,
    pub records_final: usize,
    pub skipped_rows: usize,
    pub tables_missing: usize,
    pub dropped: Vec<DroppedRecord>,
    pub reports: Vec<CountryReport>,
}

impl RunSummary {
    /// Countries that were actually fetched at least once.
    pub fn attempted(&self) -> usize {
        self.reports.iter().filter(|r| r.attempts > 0).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&CountryTarget, &FetchFailure)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            CountryOutcome::Failed(f) => Some((&r.target, f)),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub dataset: Dataset,
    pub grouped: GroupedView,
    pub normalize: NormalizeStats,
    pub summary: RunSummary,
}

/// Drives fetch → extract for every country, then aggregates and normalizes once.
pub struct Orchestrator<S> {
    source: S,
    extractor: TableExtractor,
    normalizer: Normalizer,
    fetch: FetchConfig,
    cancel: CancellationToken,
}

impl<S: PageSource> Orchestrator<S> {
    pub fn new(
        source: S,
        extractor: TableExtractor,
        normalizer: Normalizer,
        fetch: FetchConfig,
    ) -> Self {
        Self {
            source,
            extractor,
            normalizer,
            fetch,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(source: S, cfg: &Config) -> Result<Self> {
        Ok(Self::new(
            source,
            TableExtractor::from_config(&cfg.extract)?,
            Normalizer::new(&cfg.normalize),
            cfg.fetch.clone(),
        ))
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process `targets` in input order. Only an empty target list is an error;
    /// per-country failures end up in the summary.
    #[instrument(level = "info", skip_all, fields(countries = targets.len()))]
    pub async fn run(&self, targets: &[CountryTarget]) -> Result<RunOutput> {
        if targets.is_empty() {
            return Err(RunError::NoCountries.into());
        }
        let started_at = Utc::now();
        let workers = self.fetch.worker_count().min(targets.len());
        let mut state = RunState::Running;
        info!(?state, workers, "run started");

        // ─── fetch + extract, one paced lane per worker ───────────────────
        let (tx, mut rx) = mpsc::channel::<(usize, CountryReport, Vec<LcRecord>)>(workers * 2);
        let lanes = join_all((0..workers).map(|lane| {
            let tx = tx.clone();
            let jobs: Vec<(usize, &CountryTarget)> = targets
                .iter()
                .enumerate()
                .skip(lane)
                .step_by(workers)
                .collect();
            async move {
                let mut paced = Paced::new(&self.source, self.fetch.delay());
                for (idx, target) in jobs {
                    if self.cancel.is_cancelled() {
                        info!(lane, "cancelled, stopping lane");
                        break;
                    }
                    let (report, records) = self.process_country(&mut paced, target).await;
                    if tx.send((idx, report, records)).await.is_err() {
                        break;
                    }
                }
            }
        }));
        drop(tx);

        // single owner of the per-country batches; keyed by input position
        let collect = async {
            let mut done = BTreeMap::new();
            while let Some((idx, report, records)) = rx.recv().await {
                done.insert(idx, (report, records));
            }
            done
        };
        let (_, mut done) = tokio::join!(lanes, collect);

        let mut reports = Vec::with_capacity(targets.len());
        let mut batches = Vec::with_capacity(targets.len());
        for (idx, target) in targets.iter().enumerate() {
            match done.remove(&idx) {
                Some((report, records)) => {
                    reports.push(report);
                    batches.push(records);
                }
                None => reports.push(CountryReport::skipped(target.clone())),
            }
        }

        // ─── aggregate ────────────────────────────────────────────────────
        state = RunState::Aggregating;
        debug!(?state, batches = batches.len());
        let dataset = aggregate(batches);
        let records_extracted = dataset.len();

        // ─── normalize ────────────────────────────────────────────────────
        state = RunState::Normalizing;
        debug!(?state, records = records_extracted);
        let (dataset, normalize) = self.normalizer.normalize_with_stats(dataset);
        let grouped = self.normalizer.group(&dataset);

        let failed = reports.iter().filter(|r| r.is_failure()).count();
        let skipped = reports
            .iter()
            .filter(|r| r.state == CountryState::Skipped)
            .count();
        state = if failed + skipped == 0 {
            RunState::Done
        } else {
            RunState::DoneWithErrors
        };

        let mut skipped_rows = 0;
        let mut tables_missing = 0;
        for r in &reports {
            if let CountryOutcome::Extracted(stats) = &r.outcome {
                skipped_rows += stats.skipped_rows;
                if stats.tables_found == 0 {
                    tables_missing += 1;
                }
            }
        }

        let summary = RunSummary {
            state,
            started_at,
            finished_at: Utc::now(),
            countries: targets.len(),
            succeeded: reports.len() - failed - skipped,
            failed,
            skipped,
            records_extracted,
            records_final: dataset.len(),
            skipped_rows,
            tables_missing,
            dropped: normalize
                .dropped
                .iter()
                .map(|(country_id, reason)| DroppedRecord {
                    country_id: *country_id,
                    reason: reason.to_string(),
                })
                .collect(),
            reports,
        };
        info!(
            state = ?summary.state,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            records = summary.records_final,
            "run finished"
        );

        Ok(RunOutput {
            dataset,
            grouped,
            normalize,
            summary,
        })
    }

    async fn process_country(
        &self,
        paced: &mut Paced<'_, S>,
        target: &CountryTarget,
    ) -> (CountryReport, Vec<LcRecord>) {
        let mut report = CountryReport::pending(target.clone());

        report.state = CountryState::Fetching;
        let page: RawPage = loop {
            report.attempts += 1;
            let page = paced.fetch(target).await;
            if page.status.is_ok() || report.attempts > self.fetch.retry_count() {
                break page;
            }
            let backoff = self.backoff(report.attempts);
            warn!(
                country_id = target.id,
                attempt = report.attempts,
                error = ?page.status.failure(),
                backoff_ms = backoff.as_millis() as u64,
                "fetch failed, retrying"
            );
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = self.cancel.cancelled() => break page,
            }
        };

        if let FetchStatus::Failed(failure) = &page.status {
            warn!(
                country_id = target.id,
                country = %target.name,
                attempts = report.attempts,
                error = %failure,
                "country failed"
            );
            report.state = CountryState::Failed;
            report.outcome = CountryOutcome::Failed(failure.clone());
            return (report, Vec::new());
        }

        report.state = CountryState::Extracting;
        let extraction = self.extractor.extract(page);
        let stats = CountryStats {
            records: extraction.len(),
            tables_found: extraction.tables_found,
            skipped_rows: extraction.skipped_rows(),
        };
        info!(
            country_id = target.id,
            country = %target.name,
            records = stats.records,
            skipped_rows = stats.skipped_rows,
            "country done"
        );

        report.state = CountryState::Accumulated;
        report.outcome = CountryOutcome::Extracted(stats);
        (report, extraction.records)
    }

    /// `retry_backoff_ms * 2^(attempt-1)`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.fetch.retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::InputConfig, countries::read_targets, record::Value};
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    fn init_test_logging() {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lcscraper::run=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    const CHILE_PAGE: &str = r#"
        <table id="signups-table">
          <tr><th>LC</th><th>Approved</th></tr>
          <tr><td>Santiago</td><td>12</td></tr>
          <tr><td>Valparaiso</td><td>4</td></tr>
        </table>"#;

    /// Canned pages by country id; unknown ids get an empty OK page.
    #[derive(Default)]
    struct FakeSource {
        pages: HashMap<u32, Result<String, FetchFailure>>,
        /// Failures to return before a country's canned page is served.
        flaky: Mutex<HashMap<u32, u32>>,
        calls: Mutex<Vec<u32>>,
        /// When each fetch started, by country id.
        started: Mutex<HashMap<u32, tokio::time::Instant>>,
        cancel_after: Option<(usize, CancellationToken)>,
        count: AtomicUsize,
    }

    impl FakeSource {
        fn page(mut self, id: u32, page: Result<&str, FetchFailure>) -> Self {
            self.pages.insert(id, page.map(str::to_string));
            self
        }
    }

    impl PageSource for FakeSource {
        async fn fetch(&self, target: &CountryTarget) -> RawPage {
            self.calls.lock().unwrap().push(target.id);
            self.started
                .lock()
                .unwrap()
                .insert(target.id, tokio::time::Instant::now());
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_after {
                if n >= *limit {
                    token.cancel();
                }
            }

            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(&target.id) {
                    if *left > 0 {
                        *left -= 1;
                        return RawPage::failed(
                            target.clone(),
                            FetchFailure::Network {
                                reason: "connection reset".into(),
                            },
                        );
                    }
                }
            }

            match self.pages.get(&target.id) {
                Some(Ok(html)) => RawPage::new(target.clone(), FetchStatus::Ok, html.clone()),
                Some(Err(f)) => RawPage::failed(target.clone(), f.clone()),
                None => RawPage::new(target.clone(), FetchStatus::Ok, String::new()),
            }
        }
    }

    fn fetch_cfg(workers: usize, max_retries: u32) -> FetchConfig {
        FetchConfig {
            delay_ms: 0,
            workers,
            max_retries,
            retry_backoff_ms: 10,
            ..FetchConfig::default()
        }
    }

    fn orchestrator(source: FakeSource, fetch: FetchConfig) -> Orchestrator<FakeSource> {
        Orchestrator::new(
            source,
            TableExtractor::new("table#signups-table").unwrap(),
            Normalizer::default(),
            fetch,
        )
    }

    #[tokio::test]
    async fn timeout_country_is_recorded_and_run_continues() {
        init_test_logging();
        let source = FakeSource::default()
            .page(572, Err(FetchFailure::Timeout { after_ms: 20_000 }))
            .page(1566, Ok(CHILE_PAGE));
        let targets = vec![
            CountryTarget::new(572, "Afghanistan"),
            CountryTarget::new(1566, "Chile"),
        ];

        let out = orchestrator(source, fetch_cfg(1, 0))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(out.dataset.len(), 2);
        for rec in out.dataset.iter() {
            assert_eq!(rec.country_id, Some(1566));
            assert_eq!(rec.country_name.as_deref(), Some("Chile"));
        }
        assert_eq!(
            out.dataset.records()[0].get("Approved"),
            Some(&Value::Int(12))
        );
        assert_eq!(out.summary.state, RunState::DoneWithErrors);
        let failures: Vec<_> = out.summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.id, 572);
        assert_eq!(out.summary.reports[0].state, CountryState::Failed);
        assert_eq!(out.summary.reports[1].state, CountryState::Accumulated);
    }

    #[tokio::test]
    async fn empty_pages_still_count_as_done() {
        let targets = vec![CountryTarget::new(1, "A"), CountryTarget::new(2, "B")];
        let out = orchestrator(FakeSource::default(), fetch_cfg(1, 0))
            .run(&targets)
            .await
            .unwrap();
        assert!(out.dataset.is_empty());
        assert_eq!(out.summary.state, RunState::Done);
        assert_eq!(out.summary.succeeded, 2);
    }

    #[tokio::test]
    async fn zero_countries_is_fatal() {
        let err = orchestrator(FakeSource::default(), fetch_cfg(1, 0))
            .run(&[])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::NoCountries)
        ));
    }

    #[tokio::test]
    async fn attempts_match_valid_mapping_rows() {
        let csv = "Country_ID,Country_Name\n572,Afghanistan\nabc,Broken\n1566,Chile\n,Nobody\n1609,Peru\n";
        let targets = read_targets(csv.as_bytes(), &InputConfig::default()).unwrap();
        let orch = orchestrator(FakeSource::default(), fetch_cfg(1, 0));
        let out = orch.run(&targets).await.unwrap();

        assert_eq!(out.summary.attempted(), 3);
        assert_eq!(*orch.source.calls.lock().unwrap(), vec![572, 1566, 1609]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let source = FakeSource::default().page(1566, Ok(CHILE_PAGE));
        source.flaky.lock().unwrap().insert(1566, 2);
        let orch = orchestrator(source, fetch_cfg(1, 2));

        let start = tokio::time::Instant::now();
        let out = orch.run(&[CountryTarget::new(1566, "Chile")]).await.unwrap();

        assert_eq!(out.summary.state, RunState::Done);
        assert_eq!(out.summary.reports[0].attempts, 3);
        assert_eq!(out.dataset.len(), 2);
        // 10ms + 20ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_marks_failure() {
        let source = FakeSource::default().page(1566, Ok(CHILE_PAGE));
        source.flaky.lock().unwrap().insert(1566, 5);
        let out = orchestrator(source, fetch_cfg(1, 1))
            .run(&[CountryTarget::new(1566, "Chile")])
            .await
            .unwrap();

        let report = &out.summary.reports[0];
        assert_eq!(report.attempts, 2);
        assert!(matches!(
            report.outcome,
            CountryOutcome::Failed(FetchFailure::Network { .. })
        ));
        assert_eq!(out.summary.state, RunState::DoneWithErrors);
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_countries() {
        init_test_logging();
        let token = CancellationToken::new();
        let source = FakeSource {
            cancel_after: Some((2, token.clone())),
            ..FakeSource::default()
        }
        .page(2, Ok(CHILE_PAGE));
        let targets: Vec<_> = (1..=5)
            .map(|id| CountryTarget::new(id, format!("C{}", id)))
            .collect();

        let out = orchestrator(source, fetch_cfg(1, 0))
            .with_cancellation(token)
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(out.summary.attempted(), 2);
        assert_eq!(out.summary.skipped, 3);
        assert_eq!(out.summary.reports[4].state, CountryState::Skipped);
        // what was accumulated before cancelling is still normalized
        assert_eq!(out.dataset.len(), 2);
        assert_eq!(out.summary.state, RunState::DoneWithErrors);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_paced_per_worker() {
        let targets: Vec<_> = (1..=4u32)
            .map(|id| CountryTarget::new(id, format!("C{}", id)))
            .collect();
        let fetch = FetchConfig {
            delay_ms: 1000,
            ..fetch_cfg(2, 0)
        };
        let orch = orchestrator(FakeSource::default(), fetch);
        let out = orch.run(&targets).await.unwrap();
        assert_eq!(out.summary.state, RunState::Done);

        let started = orch.source.started.lock().unwrap();
        let delay = Duration::from_millis(1000);
        // round-robin: lane 0 gets ids 1 and 3, lane 1 gets ids 2 and 4
        assert!(started[&3] - started[&1] >= delay);
        assert!(started[&4] - started[&2] >= delay);
        // lanes do not wait on each other
        assert!(started[&2].saturating_duration_since(started[&1]) < delay);
        assert!(started[&1].saturating_duration_since(started[&2]) < delay);
    }

    #[tokio::test]
    async fn parallel_lanes_keep_input_order() {
        let page = |lc: &str| {
            format!(
                "<table id=\"signups-table\"><tr><th>LC</th></tr><tr><td>{}</td></tr></table>",
                lc
            )
        };
        let mut source = FakeSource::default();
        for id in 1..=7u32 {
            source.pages.insert(id, Ok(page(&format!("LC{}", id))));
        }
        let targets: Vec<_> = (1..=7u32)
            .rev()
            .map(|id| CountryTarget::new(id, format!("C{}", id)))
            .collect();

        let out = orchestrator(source, fetch_cfg(3, 0))
            .run(&targets)
            .await
            .unwrap();

        let ids: Vec<_> = out.dataset.iter().map(|r| r.country_id).collect();
        let expected: Vec<_> = (1..=7u32).rev().map(Some).collect();
        assert_eq!(ids, expected);
        let reported: Vec<_> = out.summary.reports.iter().map(|r| r.target.id).collect();
        assert_eq!(reported, (1..=7u32).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn summary_serializes_outcomes() {
        let source =
            FakeSource::default().page(572, Err(FetchFailure::Status { status: 503 }));
        let out = orchestrator(source, fetch_cfg(1, 0))
            .run(&[CountryTarget::new(572, "Afghanistan")])
            .await
            .unwrap();
        let json = serde_json::to_value(&out.summary).unwrap();
        assert_eq!(json["state"], "DONE_WITH_ERRORS");
        assert_eq!(json["reports"][0]["outcome"], "failed");
        assert_eq!(json["reports"][0]["kind"], "status");
        assert_eq!(json["reports"][0]["status"], 503);
    }
}
