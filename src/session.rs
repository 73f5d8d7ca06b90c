//! One scan invocation: its targets, its results and its cancellation token.
//!
//! A session is owned by whoever created it. Each unit is probed at most
//! once per session, so `results().len() <= targets().len()` always holds.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::dispatch::{validate_limits, Dispatcher, PhaseEnd, PhaseReport, ProgressSink, ResultSink};
use crate::error::{ScanError, ValidationError};
use crate::probe::{BannerConfig, ProbeStrategy};
use crate::scanner::{discovery_strategy, port_strategy, service_units};
use crate::types::{PortState, ProbeOutcome, Protocol, ScanMode, ScanUnit};

pub struct ScanSession {
    id: Uuid,
    targets: BTreeSet<ScanUnit>,
    results: Vec<ProbeOutcome>,
    cancel: CancellationToken,
    concurrency: usize,
    probe_timeout: Duration,
    max_scan_duration: Option<Duration>,
    started: Instant,
    progress: Option<Arc<dyn ProgressSink>>,
    sink: Option<Arc<dyn ResultSink>>,
    interface: Option<String>,
    last_end: Option<PhaseEnd>,
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("id", &self.id)
            .field("targets", &self.targets.len())
            .field("results", &self.results.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("concurrency", &self.concurrency)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl ScanSession {
    pub fn new(concurrency: usize, probe_timeout: Duration) -> Result<Self, ValidationError> {
        validate_limits(concurrency, probe_timeout)?;
        Ok(Self {
            id: Uuid::new_v4(),
            targets: BTreeSet::new(),
            results: Vec::new(),
            cancel: CancellationToken::new(),
            concurrency,
            probe_timeout,
            max_scan_duration: None,
            started: Instant::now(),
            progress: None,
            sink: None,
            interface: None,
            last_end: None,
        })
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self::new(config.concurrency, config.probe_timeout())?.with_max_duration(config.max_scan_duration()))
    }

    /// Ceiling for the whole session, measured from creation.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_scan_duration = Some(limit);
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

    /// Link to send ARP discovery on instead of the one facing each target.
    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interface = Some(name.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop dispatching. Probes already in flight still report.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle for cancelling from another task (signal handler, HTTP request).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn targets(&self) -> &BTreeSet<ScanUnit> {
        &self.targets
    }

    /// Outcomes in completion order.
    pub fn results(&self) -> &[ProbeOutcome] {
        &self.results
    }

    /// How the most recent phase ended.
    pub fn last_end(&self) -> Option<PhaseEnd> {
        self.last_end
    }

    /// Outcomes ordered by unit (address, then port).
    pub fn sorted_results(&self) -> Vec<ProbeOutcome> {
        let mut sorted = self.results.clone();
        sorted.sort_by_key(|o| o.unit);
        sorted
    }

    /// Count of outcomes per state. `open|filtered` is kept apart from `open`.
    pub fn summary(&self) -> BTreeMap<PortState, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.results {
            *counts.entry(outcome.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn into_results(self) -> Vec<ProbeOutcome> {
        self.results
    }

    /// Probe each host with ICMP echo or ARP and return the ones that answered.
    pub async fn discover_hosts<I>(&mut self, hosts: I, method: Protocol) -> Result<Vec<IpAddr>, ScanError>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let strategy = discovery_strategy(method, self.interface.as_deref())?;
        let units = hosts.into_iter().map(ScanUnit::host).collect();
        let report = self.run_phase("host discovery", units, strategy).await;
        let live = report
            .outcomes
            .iter()
            .filter(|o| o.state == PortState::Up)
            .map(|o| o.unit.ip())
            .collect::<BTreeSet<_>>();
        self.absorb(report)?;
        Ok(live.into_iter().collect())
    }

    /// Port scan of one host. `banners` turns a TCP connect scan into a banner grab.
    pub async fn scan_ports(
        &mut self,
        target: IpAddr,
        ports: &[u16],
        protocol: Protocol,
        mode: ScanMode,
        banners: Option<BannerConfig>,
    ) -> Result<PhaseEnd, ScanError> {
        let strategy = port_strategy(protocol, mode, banners)?;
        let units = service_units(target, ports)?;
        let report = self.run_phase("port scan", units, strategy).await;
        self.absorb(report)
    }

    /// Run any strategy over units not yet probed in this session.
    pub async fn run_phase(
        &mut self,
        label: &str,
        units: Vec<ScanUnit>,
        strategy: Arc<dyn ProbeStrategy>,
    ) -> PhaseReport {
        let fresh: Vec<ScanUnit> = units.into_iter().filter(|u| self.targets.insert(*u)).collect();

        let mut dispatcher = match Dispatcher::new(self.concurrency, self.probe_timeout) {
            Ok(d) => d.with_label(label),
            // Limits were validated when the session was built.
            Err(e) => {
                return PhaseReport {
                    outcomes: Vec::new(),
                    dispatched: 0,
                    settled: 0,
                    end: PhaseEnd::Aborted,
                    error: Some(e.into()),
                }
            }
        };
        if let Some(limit) = self.max_scan_duration {
            let remaining = limit.saturating_sub(self.started.elapsed());
            if remaining.is_zero() {
                warn!(session = %self.id, phase = label, "scan time ceiling already reached");
                return PhaseReport {
                    outcomes: Vec::new(),
                    dispatched: 0,
                    settled: 0,
                    end: PhaseEnd::TimedOut,
                    error: None,
                };
            }
            dispatcher = dispatcher.with_max_duration(remaining);
        }
        if let Some(progress) = &self.progress {
            dispatcher = dispatcher.with_progress(Arc::clone(progress));
        }
        if let Some(sink) = &self.sink {
            dispatcher = dispatcher.with_sink(Arc::clone(sink));
        }
        info!(session = %self.id, phase = label, units = fresh.len(), "running phase");
        dispatcher.run(fresh, strategy, &self.cancel).await
    }

    /// Keep the phase's outcomes, then surface an environment failure if any.
    fn absorb(&mut self, report: PhaseReport) -> Result<PhaseEnd, ScanError> {
        self.results.extend(report.outcomes);
        self.last_end = Some(report.end);
        debug_assert!(self.results.len() <= self.targets.len());
        match report.error {
            Some(err) => Err(err),
            None => Ok(report.end),
        }
    }
}
