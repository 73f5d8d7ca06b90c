//! Scan phases exposed to collaborators: host discovery and port scanning.
//!
//! Both validate their whole input synchronously, then hand the units to a
//! [`Dispatcher`]. The returned [`PhaseReport`] always carries whatever was
//! collected, including after cancellation or an aborted phase.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatcher, PhaseReport, ProgressSink};
use crate::error::{ValidationError, ValidationKind};
use crate::probe::{ArpRequest, BannerConfig, BannerGrab, IcmpEcho, ProbeStrategy, TcpConnect, TcpSyn, UdpProbe};
use crate::types::{Protocol, ScanMode, ScanUnit};

/// Strategy for a host discovery method. Only ICMP and ARP discover hosts;
/// `interface` pins ARP to one link and is ignored by ICMP.
pub fn discovery_strategy(method: Protocol, interface: Option<&str>) -> Result<Arc<dyn ProbeStrategy>, ValidationError> {
    match (method, interface) {
        (Protocol::Icmp, _) => Ok(Arc::new(IcmpEcho)),
        (Protocol::Arp, Some(name)) => Ok(Arc::new(ArpRequest::on(name))),
        (Protocol::Arp, None) => Ok(Arc::new(ArpRequest::default())),
        (other, _) => Err(ValidationError::new(ValidationKind::Protocol, other.to_string())),
    }
}

/// Strategy for a port scan. `banners` upgrades a TCP connect scan to a banner grab.
pub fn port_strategy(
    protocol: Protocol,
    mode: ScanMode,
    banners: Option<BannerConfig>,
) -> Result<Arc<dyn ProbeStrategy>, ValidationError> {
    match (protocol, mode, banners) {
        (Protocol::Tcp, ScanMode::Connect, Some(cfg)) => Ok(Arc::new(BannerGrab::new(cfg))),
        (Protocol::Tcp, ScanMode::Connect, None) => Ok(Arc::new(TcpConnect)),
        (Protocol::Tcp, ScanMode::Syn, _) => Ok(Arc::new(TcpSyn)),
        (Protocol::Udp, _, _) => Ok(Arc::new(UdpProbe)),
        (other, _, _) => Err(ValidationError::new(ValidationKind::Protocol, other.to_string())),
    }
}

/// `(target, port)` units for every port, rejecting port 0.
pub fn service_units(target: IpAddr, ports: &[u16]) -> Result<Vec<ScanUnit>, ValidationError> {
    ports
        .iter()
        .map(|&port| {
            if port == 0 {
                Err(ValidationError::new(ValidationKind::PortRange, "0"))
            } else {
                Ok(ScanUnit::service(target, port))
            }
        })
        .collect()
}

fn dispatcher(
    concurrency: usize,
    timeout: Duration,
    label: &str,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<Dispatcher, ValidationError> {
    let mut dispatcher = Dispatcher::new(concurrency, timeout)?.with_label(label);
    if let Some(progress) = progress {
        dispatcher = dispatcher.with_progress(progress);
    }
    Ok(dispatcher)
}

/// Probe every address with `method` (ICMP echo or ARP). Only hosts that
/// answered appear in the outcomes, each as `up`.
pub async fn run_host_discovery<I>(
    targets: I,
    method: Protocol,
    concurrency: usize,
    timeout: Duration,
    cancel: &CancellationToken,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<PhaseReport, ValidationError>
where
    I: IntoIterator<Item = IpAddr>,
{
    let strategy = discovery_strategy(method, None)?;
    let dispatcher = dispatcher(concurrency, timeout, "host discovery", progress)?;
    let units = targets.into_iter().map(ScanUnit::host).collect();
    Ok(dispatcher.run(units, strategy, cancel).await)
}

/// Probe `ports` on `target` over TCP (connect or SYN) or UDP.
#[allow(clippy::too_many_arguments)]
pub async fn run_port_scan(
    target: IpAddr,
    ports: &[u16],
    protocol: Protocol,
    mode: ScanMode,
    concurrency: usize,
    timeout: Duration,
    cancel: &CancellationToken,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<PhaseReport, ValidationError> {
    let strategy = port_strategy(protocol, mode, None)?;
    let dispatcher = dispatcher(concurrency, timeout, "port scan", progress)?;
    let units = service_units(target, ports)?;
    Ok(dispatcher.run(units, strategy, cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::PhaseEnd;
    use crate::types::PortState;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn connect_scan_reports_open_and_closed_loopback_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = spare.local_addr().unwrap().port();
        drop(spare);

        let report = run_port_scan(
            LOCALHOST,
            &[open, closed],
            Protocol::Tcp,
            ScanMode::Connect,
            4,
            Duration::from_secs(1),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.end, PhaseEnd::Completed);
        assert_eq!(report.outcomes.len(), 2);
        let state_of = |port| {
            report
                .outcomes
                .iter()
                .find(|o| o.unit.port() == Some(port))
                .map(|o| o.state)
        };
        assert_eq!(state_of(open), Some(PortState::Open));
        assert_eq!(state_of(closed), Some(PortState::Closed));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_probing() {
        let cancel = CancellationToken::new();
        let err = run_port_scan(LOCALHOST, &[80], Protocol::Icmp, ScanMode::Connect, 1, Duration::from_secs(1), &cancel, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ValidationKind::Protocol);

        let err = run_port_scan(LOCALHOST, &[80], Protocol::Tcp, ScanMode::Connect, 0, Duration::from_secs(1), &cancel, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ValidationKind::Concurrency);

        let err = run_host_discovery([LOCALHOST], Protocol::Tcp, 1, Duration::from_secs(1), &cancel, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ValidationKind::Protocol);
    }

    #[test]
    fn port_zero_is_out_of_range() {
        let err = service_units(LOCALHOST, &[22, 0]).unwrap_err();
        assert_eq!(err.kind, ValidationKind::PortRange);
    }

    #[test]
    fn banner_option_selects_banner_grab() {
        let s = port_strategy(Protocol::Tcp, ScanMode::Connect, Some(BannerConfig::default())).unwrap();
        assert!(s.budget(Duration::from_secs(1)) > Duration::from_secs(1));
        let s = port_strategy(Protocol::Udp, ScanMode::Syn, None).unwrap();
        assert_eq!(s.protocol(), Protocol::Udp);
    }
}
