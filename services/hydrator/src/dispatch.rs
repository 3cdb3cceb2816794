//! Work dispatch
//!
//! The input reader feeds identifiers into a bounded channel drained by a
//! fixed set of workers, one per pool client. A worker handles one
//! identifier end to end (fetch, then record) before taking the next, so
//! results land in completion order.
//!
//! On cancellation the reader stops and workers exit after their in-flight
//! identifier. A write error cancels the run and is returned once every
//! worker has stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use remote::EntityId;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::fetch::{FetchStatus, Fetcher};
use crate::input::InputReader;
use crate::metrics;
use crate::writer::Writer;

/// Counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub malformed: usize,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    interrupted: AtomicUsize,
}

/// Process every identifier from `input` with `workers` concurrent workers.
pub async fn run(
    mut input: InputReader,
    fetcher: Arc<Fetcher>,
    writer: Arc<Writer>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<EntityId>(workers * 2);
    let rx = Arc::new(Mutex::new(rx));
    let counters = Arc::new(Counters::default());

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        tasks.spawn(work(
            worker,
            Arc::clone(&rx),
            Arc::clone(&fetcher),
            Arc::clone(&writer),
            Arc::clone(&counters),
            cancel.clone(),
        ));
    }
    info!(workers, "dispatch started");

    let mut dispatched = 0usize;
    let mut failure: Option<Error> = None;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = input.next_entity() => next,
        };
        let entity = match next {
            Ok(Some(entity)) => entity,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "input read failed, stopping run");
                cancel.cancel();
                failure = Some(e);
                break;
            }
        };
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = tx.send(entity) => sent,
        };
        if sent.is_err() {
            break;
        }
        dispatched += 1;
    }
    drop(tx);

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(e) => error!(error = %e, "worker task panicked"),
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    let summary = RunSummary {
        dispatched,
        succeeded: counters.succeeded.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        interrupted: counters.interrupted.load(Ordering::Relaxed),
        malformed: input.malformed(),
    };
    if cancel.is_cancelled() {
        warn!(?summary, "run interrupted");
    }
    Ok(summary)
}

async fn work(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<EntityId>>>,
    fetcher: Arc<Fetcher>,
    writer: Arc<Writer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = rx.recv() => next,
            }
        };
        let Some(entity) = next else {
            return Ok(());
        };

        let outcome = fetcher.fetch(entity).await;
        let counter = match outcome.status {
            FetchStatus::Success => &counters.succeeded,
            FetchStatus::Failure(_) => &counters.failed,
            FetchStatus::Interrupted => &counters.interrupted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_entity(outcome.status.kind());

        if let Err(e) = writer.record(&outcome).await {
            error!(worker, entity = %outcome.entity, error = %e, "write failed, cancelling run");
            cancel.cancel();
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Aggregation;
    use crate::writer::STATUS_LOG;
    use remote::testing::{InFlight, ScriptedApi, post, profile};
    use remote::{ApiError, TimelineApi};
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;
    use twitter_pool::{Pool, PoolConfig};

    struct Harness {
        _dir: tempfile::TempDir,
        input: std::path::PathBuf,
        output: std::path::PathBuf,
    }

    fn harness(lines: &[String]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.ndjson");
        std::fs::write(&input, lines.join("\n")).unwrap();
        let output = dir.path().join("out");
        Harness {
            _dir: dir,
            input,
            output,
        }
    }

    async fn run_with(
        h: &Harness,
        apis: Vec<ScriptedApi>,
        aggregation: Aggregation,
        cancel: CancellationToken,
    ) -> (Result<RunSummary>, Arc<Pool>) {
        let clients: Vec<Arc<dyn TimelineApi>> = apis
            .into_iter()
            .map(|api| Arc::new(api) as Arc<dyn TimelineApi>)
            .collect();
        let pool = Arc::new(Pool::new(clients, PoolConfig::default()).unwrap());
        let fetcher = Arc::new(Fetcher::new(Arc::clone(&pool), 15, cancel.clone()));
        let writer = Arc::new(
            Writer::open(&h.output, aggregation, "hydrated.ndjson")
                .await
                .unwrap(),
        );
        let input = InputReader::open(&h.input).await.unwrap();
        let result = run(input, fetcher, writer, pool.size(), cancel).await;
        (result, pool)
    }

    fn status_lines(output: &Path) -> Vec<String> {
        std::fs::read_to_string(output.join(STATUS_LOG))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn populated(id: &str, tracker: &Arc<InFlight>, ids: std::ops::Range<u64>) -> ScriptedApi {
        let mut api = ScriptedApi::new(id)
            .with_tracker(Arc::clone(tracker))
            .with_delay(Duration::from_millis(1));
        for n in ids {
            api = api.with_entity(n, profile(n, &format!("user{n}")), vec![vec![post(n, "hi")]]);
        }
        api
    }

    #[tokio::test]
    async fn three_clients_bound_concurrency_over_hundred_ids() {
        let lines: Vec<String> = (1..=100).map(|n| format!("{{\"id\": {n}}}")).collect();
        let h = harness(&lines);
        let tracker = InFlight::new();
        let apis = vec![
            populated("a", &tracker, 1..101),
            populated("b", &tracker, 1..101),
            populated("c", &tracker, 1..101),
        ];

        let (result, pool) =
            run_with(&h, apis, Aggregation::Compact, CancellationToken::new()).await;
        let summary = result.unwrap();

        assert_eq!(summary.dispatched, 100);
        assert_eq!(summary.succeeded, 100);
        assert!(tracker.peak() <= 3, "peak in-flight calls: {}", tracker.peak());
        assert!(pool.peak_leased() <= 3);
        assert_eq!(pool.leased(), 0);

        let lines = status_lines(&h.output);
        assert_eq!(lines.len(), 100);
        let mut per_id: HashMap<String, usize> = HashMap::new();
        for line in &lines {
            assert!(line.ends_with(",Done"), "got: {line}");
            *per_id.entry(line.clone()).or_default() += 1;
        }
        assert!(per_id.values().all(|&count| count == 1));
        let records = std::fs::read_to_string(h.output.join("hydrated.ndjson")).unwrap();
        assert_eq!(records.lines().count(), 100);
    }

    #[tokio::test]
    async fn failures_and_malformed_lines_are_counted() {
        let lines = vec![
            "{\"id\": 42}".to_string(),
            "garbage".to_string(),
            "{\"id\": 99}".to_string(),
            String::new(),
        ];
        let h = harness(&lines);
        let api = ScriptedApi::new("a").with_entity(42u64, profile(42, "x"), vec![vec![post(1, "hi")]]);

        let (result, _) = run_with(&h, vec![api], Aggregation::Complete, CancellationToken::new()).await;
        let summary = result.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                dispatched: 2,
                succeeded: 1,
                failed: 1,
                interrupted: 0,
                malformed: 1,
            }
        );
        let mut lines = status_lines(&h.output);
        lines.sort();
        assert_eq!(lines, vec!["42,Done", "99,User not found."]);
        assert!(h.output.join("timelines").join("42.ndjson").exists());
        assert!(!h.output.join("timelines").join("99.ndjson").exists());
    }

    #[tokio::test]
    async fn rate_limited_entity_ends_in_exactly_one_record() {
        let h = harness(&["{\"id\": 42}".to_string()]);
        let a = ScriptedApi::new("a")
            .with_entity(42u64, profile(42, "x"), vec![vec![post(1, "hi")]])
            .fail_profile(
                42u64,
                ApiError::RateLimited {
                    reset_in: Some(Duration::from_secs(600)),
                },
            );
        let b = ScriptedApi::new("b").with_entity(42u64, profile(42, "x"), vec![vec![post(1, "hi")]]);

        let (result, _) = run_with(&h, vec![a, b], Aggregation::Compact, CancellationToken::new()).await;

        assert_eq!(result.unwrap().succeeded, 1);
        assert_eq!(status_lines(&h.output), vec!["42,Done"]);
        let records = std::fs::read_to_string(h.output.join("hydrated.ndjson")).unwrap();
        assert_eq!(records.lines().count(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing_new() {
        let lines: Vec<String> = (1..=20).map(|n| format!("{{\"id\": {n}}}")).collect();
        let h = harness(&lines);
        let tracker = InFlight::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, _) = run_with(
            &h,
            vec![populated("a", &tracker, 1..21)],
            Aggregation::Compact,
            cancel,
        )
        .await;
        let summary = result.unwrap();

        assert_eq!(summary.dispatched, 0);
        assert_eq!(tracker.total(), 0);
        assert!(status_lines(&h.output).is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_run_finishes_in_flight_work() {
        let lines: Vec<String> = (1..=50).map(|n| format!("{{\"id\": {n}}}")).collect();
        let h = harness(&lines);
        let tracker = InFlight::new();
        let api = populated("a", &tracker, 1..51).with_delay(Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let (result, pool) = run_with(&h, vec![api], Aggregation::Compact, cancel).await;
        canceller.await.unwrap();
        let summary = result.unwrap();

        assert!(summary.dispatched < 50, "dispatched {}", summary.dispatched);
        let lines = status_lines(&h.output);
        let processed = summary.succeeded + summary.failed + summary.interrupted;
        assert_eq!(lines.len(), processed, "every processed id has one line");
        assert!(processed <= summary.dispatched);
        assert_eq!(pool.leased(), 0);
    }

    #[tokio::test]
    async fn write_failure_aborts_the_run() {
        let lines: Vec<String> = (1..=5).map(|n| format!("{{\"id\": {n}}}")).collect();
        let h = harness(&lines);
        let tracker = InFlight::new();
        let cancel = CancellationToken::new();

        let clients: Vec<Arc<dyn TimelineApi>> =
            vec![Arc::new(populated("a", &tracker, 1..6)) as Arc<dyn TimelineApi>];
        let pool = Arc::new(Pool::new(clients, PoolConfig::default()).unwrap());
        let fetcher = Arc::new(Fetcher::new(Arc::clone(&pool), 15, cancel.clone()));
        let writer = Arc::new(
            Writer::open(&h.output, Aggregation::Complete, "hydrated.ndjson")
                .await
                .unwrap(),
        );
        // Timeline files can no longer be created
        std::fs::remove_dir_all(h.output.join("timelines")).unwrap();

        let input = InputReader::open(&h.input).await.unwrap();
        let err = run(input, fetcher, writer, 1, cancel.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Output { .. }), "got: {err}");
        assert!(cancel.is_cancelled());
        assert!(tracker.total() < 10, "run stopped early: {} calls", tracker.total());
    }
}
