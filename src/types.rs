use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One unit of probing work: a host (discovery) or a host:port pair (port scan).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanUnit {
    Host { ip: IpAddr },
    Service { ip: IpAddr, port: u16 },
}

impl ScanUnit {
    pub fn host(ip: IpAddr) -> Self {
        ScanUnit::Host { ip }
    }

    pub fn service(ip: IpAddr, port: u16) -> Self {
        ScanUnit::Service { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        match *self {
            ScanUnit::Host { ip } | ScanUnit::Service { ip, .. } => ip,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match *self {
            ScanUnit::Host { .. } => None,
            ScanUnit::Service { port, .. } => Some(port),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.port().map(|port| SocketAddr::new(self.ip(), port))
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanUnit::Host { ip } => write!(f, "{ip}"),
            ScanUnit::Service { ip, port } => write!(f, "{}", SocketAddr::new(*ip, *port)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Icmp,
    Arp,
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Icmp => "icmp",
            Protocol::Arp => "arp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// Classified state of a probed unit. `OpenOrFiltered` stays distinct from `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    OpenOrFiltered,
    Up,
    Down,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
            PortState::OpenOrFiltered => "open|filtered",
            PortState::Up => "up",
            PortState::Down => "down",
        })
    }
}

/// Transport-level port scan technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    Connect,
    Syn,
}

/// Bytes captured from a service. Serialized as lossy UTF-8 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Banner(pub Vec<u8>);

impl Banner {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Printable single-line form: control line breaks escaped.
    pub fn to_display_string(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .replace('\n', "\\n")
            .replace('\r', "\\r")
    }
}

impl Serialize for Banner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

impl<'de> Deserialize<'de> for Banner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Banner(s.into_bytes()))
    }
}

/// Result of probing one unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub unit: ScanUnit,
    pub protocol: Protocol,
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<Banner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_mac: Option<String>,
    pub observed_at: String,
}

impl ProbeOutcome {
    pub fn new(unit: ScanUnit, protocol: Protocol, state: PortState) -> Self {
        Self {
            unit,
            protocol,
            state,
            round_trip_time: None,
            banner: None,
            peer_mac: None,
            observed_at: now_rfc3339(),
        }
    }

    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.round_trip_time = Some(rtt);
        self
    }

    pub fn with_banner(mut self, banner: Vec<u8>) -> Self {
        self.banner = Some(Banner(banner));
        self
    }

    pub fn with_peer_mac(mut self, mac: impl Into<String>) -> Self {
        self.peer_mac = Some(mac.into());
        self
    }
}

/// What a probe strategy returns: a classified verdict, or nothing worth recording.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Verdict(ProbeOutcome),
    NoVerdict,
}

impl Outcome {
    pub fn verdict(self) -> Option<ProbeOutcome> {
        match self {
            Outcome::Verdict(o) => Some(o),
            Outcome::NoVerdict => None,
        }
    }
}

/// Coarse OS estimate derived from observed ICMP reply TTLs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OsFingerprint {
    pub label: String,
    pub sampled_ttl: Option<u8>,
}

/// One responding traceroute hop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub ttl: u8,
    pub address: IpAddr,
    pub rtt: Duration,
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
