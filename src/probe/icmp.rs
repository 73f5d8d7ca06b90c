//! ICMP echo over a raw socket.
//!
//! Shared by host discovery, OS fingerprinting and traceroute. The blocking
//! send/receive runs on the blocking pool; callers wrap it in
//! `spawn_blocking`.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::debug;

use super::{ipv4_target, ProbeStrategy};
use crate::classify::discovery_state;
use crate::error::ScanError;
use crate::types::{Outcome, ProbeOutcome, Protocol, ScanUnit};

const ECHO_PAYLOAD: &[u8] = b"hosthawk";
const ECHO_HEADER_LEN: usize = 8;
const ICMP_ECHO_REQUEST: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpReplyKind {
    EchoReply,
    TimeExceeded,
    Unreachable { code: u8 },
}

/// A reply matched to one of our echo requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpReply {
    pub source: Ipv4Addr,
    /// TTL observed on the reply's IP header, not the one we sent.
    pub ttl: u8,
    pub kind: IcmpReplyKind,
    pub rtt: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EchoRequest {
    pub target: Ipv4Addr,
    pub ident: u16,
    pub sequence: u16,
    pub ttl: Option<u8>,
}

impl EchoRequest {
    pub fn new(target: Ipv4Addr, ttl: Option<u8>) -> Self {
        Self {
            target,
            ident: rand::random(),
            sequence: rand::random(),
            ttl,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ECHO_HEADER_LEN + ECHO_PAYLOAD.len()];
        if let Some(mut pkt) = MutableEchoRequestPacket::new(&mut buf) {
            pkt.set_icmp_type(IcmpTypes::EchoRequest);
            pkt.set_identifier(self.ident);
            pkt.set_sequence_number(self.sequence);
            pkt.set_payload(ECHO_PAYLOAD);
        }
        // Word 1 holds the checksum field itself.
        let sum = pnet::util::checksum(&buf, 1);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Match a raw IPv4 datagram against this request.
    ///
    /// Echo replies must come from the target; time-exceeded and unreachable
    /// errors must quote our request. Anything else, including bytes that do
    /// not parse, is ignored.
    pub fn match_reply(&self, datagram: &[u8]) -> Option<(Ipv4Addr, u8, IcmpReplyKind)> {
        let ip = Ipv4Packet::new(datagram)?;
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return None;
        }
        let icmp_bytes = datagram.get(usize::from(ip.get_header_length()) * 4..)?;
        let icmp = IcmpPacket::new(icmp_bytes)?;
        let icmp_type = icmp.get_icmp_type();

        if icmp_type == IcmpTypes::EchoReply {
            let echo = EchoReplyPacket::new(icmp_bytes)?;
            let ours = ip.get_source() == self.target
                && echo.get_identifier() == self.ident
                && echo.get_sequence_number() == self.sequence;
            return ours.then_some((ip.get_source(), ip.get_ttl(), IcmpReplyKind::EchoReply));
        }

        let kind = if icmp_type == IcmpTypes::TimeExceeded {
            IcmpReplyKind::TimeExceeded
        } else if icmp_type == IcmpTypes::DestinationUnreachable {
            IcmpReplyKind::Unreachable {
                code: icmp.get_icmp_code().0,
            }
        } else {
            return None;
        };

        // Error messages quote the original IP header plus 8 bytes of ICMP.
        let quoted = icmp_bytes.get(ECHO_HEADER_LEN..)?;
        let inner = Ipv4Packet::new(quoted)?;
        if inner.get_destination() != self.target {
            return None;
        }
        let start = usize::from(inner.get_header_length()) * 4;
        let echo = quoted.get(start..start + ECHO_HEADER_LEN)?;
        let ident = u16::from_be_bytes([echo[4], echo[5]]);
        let sequence = u16::from_be_bytes([echo[6], echo[7]]);
        let ours = echo[0] == ICMP_ECHO_REQUEST && ident == self.ident && sequence == self.sequence;
        ours.then_some((ip.get_source(), ip.get_ttl(), kind))
    }
}

/// Send one echo request and wait for a matching reply. Blocking.
///
/// `Ok(None)` means no usable reply arrived before `timeout`.
pub fn send_echo(req: &EchoRequest, timeout: Duration) -> Result<Option<IcmpReply>, ScanError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4))
        .map_err(|e| ScanError::from_io("icmp raw socket", e))?;
    if let Some(ttl) = req.ttl {
        socket
            .set_ttl(u32::from(ttl))
            .map_err(|e| ScanError::from_io("icmp ttl", e))?;
    }

    let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(req.target), 0));
    let sent_at = Instant::now();
    if let Err(e) = socket.send_to(&req.to_bytes(), &dest) {
        debug!(target = %req.target, error = %e, "icmp send failed");
        return Ok(None);
    }

    let deadline = sent_at + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        // A zero timeval would block forever.
        let remaining = (deadline - now).max(Duration::from_millis(1));
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ScanError::from_io("icmp read timeout", e))?;
        match (&socket).read(&mut buf) {
            Ok(n) => {
                if let Some((source, ttl, kind)) = req.match_reply(&buf[..n]) {
                    return Ok(Some(IcmpReply {
                        source,
                        ttl,
                        kind,
                        rtt: sent_at.elapsed(),
                    }));
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!(target = %req.target, error = %e, "icmp receive failed");
                return Ok(None);
            }
        }
    }
}

/// Async wrapper over [`send_echo`].
pub async fn echo(target: Ipv4Addr, ttl: Option<u8>, timeout: Duration) -> Result<Option<IcmpReply>, ScanError> {
    let req = EchoRequest::new(target, ttl);
    tokio::task::spawn_blocking(move || send_echo(&req, timeout)).await?
}

/// Host discovery by ICMP echo. Silence yields no verdict, never `down`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpEcho;

#[async_trait]
impl ProbeStrategy for IcmpEcho {
    fn protocol(&self) -> Protocol {
        Protocol::Icmp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let target = ipv4_target(&unit, "icmp echo")?;
        let reply = echo(target, None, timeout)
            .await?
            .filter(|r| r.kind == IcmpReplyKind::EchoReply);
        let state = discovery_state(reply.is_some());
        Ok(match (state, reply) {
            (Some(state), Some(r)) => {
                debug!(%unit, rtt = ?r.rtt, ttl = r.ttl, "echo reply");
                Outcome::Verdict(ProbeOutcome::new(unit, Protocol::Icmp, state).with_rtt(r.rtt))
            }
            _ => Outcome::NoVerdict,
        })
    }
}
