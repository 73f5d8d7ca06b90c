//! Bounded parallel execution of a probe strategy over a queue of units.
//!
//! Workers are tokio tasks in a [`JoinSet`]. They pull from a shared slice
//! through an atomic cursor, so no unit is ever handed out twice, and send
//! what they observe over an mpsc channel that the dispatcher drains. The
//! caller's [`CancellationToken`] is observed between pulls; in-flight probes
//! finish on their own timeout. Every phase runs under a child token so a
//! fatal error stops this phase without cancelling the caller's session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ScanError, ValidationError, ValidationKind};
use crate::probe::ProbeStrategy;
use crate::types::{Outcome, ProbeOutcome, ScanUnit};

/// Extra time granted to in-flight probes after cancellation, on top of the
/// strategy's own budget.
const CANCEL_SLACK: Duration = Duration::from_millis(250);

/// Receives `(completed, total, description)` after every settled probe.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, completed: usize, total: usize, description: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize, &str) + Send + Sync,
{
    fn progress(&self, completed: usize, total: usize, description: &str) {
        self(completed, total, description)
    }
}

/// Receives every recorded outcome as soon as it is known.
pub trait ResultSink: Send + Sync {
    fn accept(&self, outcome: &ProbeOutcome);
}

impl ResultSink for mpsc::UnboundedSender<ProbeOutcome> {
    fn accept(&self, outcome: &ProbeOutcome) {
        // A closed receiver only means nobody is listening any more.
        let _ = self.send(outcome.clone());
    }
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEnd {
    /// The queue was exhausted.
    Completed,
    /// The cancellation token was set before the queue ran out.
    Cancelled,
    /// The per-scan time ceiling was hit; in-flight probes were aborted.
    TimedOut,
    /// A probe hit an environment failure; see [`PhaseReport::error`].
    Aborted,
}

impl PhaseEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseEnd::Completed => "completed",
            PhaseEnd::Cancelled => "cancelled",
            PhaseEnd::TimedOut => "timed_out",
            PhaseEnd::Aborted => "aborted",
        }
    }
}

/// Everything a phase produced. Outcomes are in completion order.
#[derive(Debug)]
pub struct PhaseReport {
    pub outcomes: Vec<ProbeOutcome>,
    /// Units handed to a worker (settled or not).
    pub dispatched: usize,
    /// Units whose probe returned, with or without a verdict.
    pub settled: usize,
    pub end: PhaseEnd,
    pub error: Option<ScanError>,
}

impl PhaseReport {
    fn empty(end: PhaseEnd) -> Self {
        Self {
            outcomes: Vec::new(),
            dispatched: 0,
            settled: 0,
            end,
            error: None,
        }
    }
}

enum Event {
    Settled(ScanUnit, Outcome),
    Fatal(ScanUnit, ScanError),
}

#[derive(Clone)]
pub struct Dispatcher {
    concurrency: usize,
    probe_timeout: Duration,
    max_duration: Option<Duration>,
    progress: Option<Arc<dyn ProgressSink>>,
    sink: Option<Arc<dyn ResultSink>>,
    label: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("concurrency", &self.concurrency)
            .field("probe_timeout", &self.probe_timeout)
            .field("max_duration", &self.max_duration)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Reject a worker count or timeout that cannot drive a scan.
pub fn validate_limits(concurrency: usize, timeout: Duration) -> Result<(), ValidationError> {
    if concurrency == 0 {
        return Err(ValidationError::new(ValidationKind::Concurrency, concurrency.to_string()));
    }
    if timeout.is_zero() {
        return Err(ValidationError::new(
            ValidationKind::Timeout,
            format!("{}ms", timeout.as_millis()),
        ));
    }
    Ok(())
}

impl Dispatcher {
    pub fn new(concurrency: usize, probe_timeout: Duration) -> Result<Self, ValidationError> {
        validate_limits(concurrency, probe_timeout)?;
        Ok(Self {
            concurrency,
            probe_timeout,
            max_duration: None,
            progress: None,
            sink: None,
            label: String::from("probe"),
        })
    }

    /// Hard wall-clock ceiling for the phase, cancellation grace included.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub async fn run(
        &self,
        units: Vec<ScanUnit>,
        strategy: Arc<dyn ProbeStrategy>,
        cancel: &CancellationToken,
    ) -> PhaseReport {
        let total = units.len();
        if cancel.is_cancelled() {
            debug!(phase = %self.label, "cancelled before dispatch");
            return PhaseReport::empty(PhaseEnd::Cancelled);
        }
        if total == 0 {
            return PhaseReport::empty(PhaseEnd::Completed);
        }

        let started = Instant::now();
        let queue: Arc<[ScanUnit]> = units.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let phase = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workers = self.concurrency.min(total);
        info!(phase = %self.label, protocol = %strategy.protocol(), total, workers, "phase started");

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(worker(
                Arc::clone(&queue),
                Arc::clone(&cursor),
                Arc::clone(&strategy),
                phase.clone(),
                tx.clone(),
                self.probe_timeout,
            ));
        }
        // The channel closes once every worker has dropped its sender.
        drop(tx);

        let ceiling = self.max_duration.map(|d| started + d);
        let grace = strategy.budget(self.probe_timeout) + CANCEL_SLACK;
        let mut report = PhaseReport::empty(PhaseEnd::Completed);
        let mut cancel_deadline: Option<Instant> = None;

        loop {
            let wake = match (ceiling, cancel_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.record(&mut report, event, total, &phase),
                    None => break,
                },
                _ = phase.cancelled(), if cancel_deadline.is_none() => {
                    cancel_deadline = Some(Instant::now() + grace);
                    if report.end == PhaseEnd::Completed {
                        report.end = PhaseEnd::Cancelled;
                        warn!(phase = %self.label, settled = report.settled, "cancellation requested; draining in-flight probes");
                    }
                }
                _ = async {
                    match wake {
                        Some(at) => time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if ceiling.is_some_and(|c| Instant::now() >= c) {
                        warn!(phase = %self.label, settled = report.settled, "scan time ceiling reached; aborting in-flight probes");
                        if report.end != PhaseEnd::Aborted {
                            report.end = PhaseEnd::TimedOut;
                        }
                    } else {
                        warn!(phase = %self.label, "in-flight probes overran their budget; aborting");
                    }
                    phase.cancel();
                    set.abort_all();
                    break;
                }
            }
        }

        // Reap every task so nothing outlives this call.
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() && report.error.is_none() {
                    report.error = Some(ScanError::from(e));
                    report.end = PhaseEnd::Aborted;
                }
            }
        }
        // Events sent between the last recv and the abort are still valid.
        while let Ok(event) = rx.try_recv() {
            self.record(&mut report, event, total, &phase);
        }

        report.dispatched = cursor.load(Ordering::Acquire).min(total);
        info!(
            phase = %self.label,
            end = report.end.as_str(),
            dispatched = report.dispatched,
            recorded = report.outcomes.len(),
            elapsed = ?started.elapsed(),
            "phase finished"
        );
        report
    }

    fn record(&self, report: &mut PhaseReport, event: Event, total: usize, phase: &CancellationToken) {
        match event {
            Event::Settled(unit, outcome) => {
                report.settled += 1;
                if let Outcome::Verdict(outcome) = outcome {
                    if let Some(sink) = &self.sink {
                        sink.accept(&outcome);
                    }
                    report.outcomes.push(outcome);
                }
                if let Some(progress) = &self.progress {
                    progress.progress(report.settled, total, &format!("{} {unit}", self.label));
                }
            }
            Event::Fatal(unit, err) => {
                warn!(phase = %self.label, %unit, error = %err, "probe failed; aborting phase");
                phase.cancel();
                if report.error.is_none() {
                    report.error = Some(err);
                    report.end = PhaseEnd::Aborted;
                }
            }
        }
    }
}

async fn worker(
    queue: Arc<[ScanUnit]>,
    cursor: Arc<AtomicUsize>,
    strategy: Arc<dyn ProbeStrategy>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Event>,
    timeout: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let index = cursor.fetch_add(1, Ordering::AcqRel);
        let Some(&unit) = queue.get(index) else {
            return;
        };
        let event = match strategy.probe(unit, timeout).await {
            Ok(outcome) => Event::Settled(unit, outcome),
            Err(err) => Event::Fatal(unit, err),
        };
        let fatal = matches!(event, Event::Fatal(..));
        if tx.send(event).is_err() || fatal {
            return;
        }
    }
}
