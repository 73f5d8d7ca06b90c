//! Probe strategies: one network operation per unit, classified on return.
//!
//! Each strategy owns any socket or packet handle it opens for exactly the
//! duration of one probe; nothing is shared between concurrent invocations.
//! Expected network failures become a [`PortState`](crate::types::PortState)
//! or [`Outcome::NoVerdict`]; only environment failures (no raw socket, no
//! interface) come back as `Err`.

pub mod arp;
pub mod banner;
pub mod icmp;
pub mod syn;
pub mod tcp;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScanError;
use crate::types::{Outcome, Protocol, ScanUnit};

pub use arp::ArpRequest;
pub use banner::{grab_banner, BannerConfig, BannerGrab};
pub use icmp::IcmpEcho;
pub use syn::TcpSyn;
pub use tcp::TcpConnect;
pub use udp::UdpProbe;

#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Probe a single unit, returning within [`ProbeStrategy::budget`].
    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError>;

    /// Worst-case wall-clock time of one probe for the given timeout.
    fn budget(&self, timeout: Duration) -> Duration {
        timeout
    }
}

pub(crate) fn ipv4_target(unit: &ScanUnit, operation: &'static str) -> Result<Ipv4Addr, ScanError> {
    match unit.ip() {
        IpAddr::V4(v4) => Ok(v4),
        ip => Err(ScanError::Unsupported {
            operation,
            target: ip.to_string(),
        }),
    }
}

pub(crate) fn service_addr(unit: &ScanUnit, operation: &'static str) -> Result<SocketAddr, ScanError> {
    unit.socket_addr().ok_or_else(|| ScanError::Unsupported {
        operation,
        target: unit.to_string(),
    })
}
