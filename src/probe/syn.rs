//! Half-open TCP scan over a raw socket.
//!
//! A SYN is sent from a random source port; a SYN+ACK is answered with an
//! explicit RST so no connection is ever completed on the target.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};
use rand::Rng;
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use tracing::debug;

use super::{ipv4_target, ProbeStrategy};
use crate::classify::{syn_state, TcpReplyFlags};
use crate::error::ScanError;
use crate::netdetect::source_addr_for;
use crate::types::{Outcome, ProbeOutcome, Protocol, ScanUnit};

const TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynProbe {
    pub source: Ipv4Addr,
    pub target: Ipv4Addr,
    pub source_port: u16,
    pub target_port: u16,
    pub sequence: u32,
}

impl SynProbe {
    /// Build a bare TCP segment with a valid checksum.
    pub fn segment(&self, flags: u8, sequence: u32, acknowledgement: u32) -> Vec<u8> {
        let mut buf = vec![0u8; TCP_HEADER_LEN];
        if let Some(mut seg) = MutableTcpPacket::new(&mut buf) {
            seg.set_source(self.source_port);
            seg.set_destination(self.target_port);
            seg.set_sequence(sequence);
            seg.set_acknowledgement(acknowledgement);
            seg.set_data_offset(5);
            seg.set_flags(flags.into());
            seg.set_window(1024);
            let sum = tcp::ipv4_checksum(&seg.to_immutable(), &self.source, &self.target);
            seg.set_checksum(sum);
        }
        buf
    }

    pub fn syn(&self) -> Vec<u8> {
        self.segment(TcpFlags::SYN as u8, self.sequence, 0)
    }

    /// RST that tears down the half-open session the target just acknowledged.
    pub fn rst(&self, their_ack: u32) -> Vec<u8> {
        self.segment(TcpFlags::RST as u8, their_ack, 0)
    }

    /// Extract flags and the acknowledgement number from a reply to this probe.
    pub fn match_reply(&self, datagram: &[u8]) -> Option<(TcpReplyFlags, u32)> {
        let ip = Ipv4Packet::new(datagram)?;
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp || ip.get_source() != self.target {
            return None;
        }
        let seg = TcpPacket::new(datagram.get(usize::from(ip.get_header_length()) * 4..)?)?;
        if seg.get_source() != self.target_port || seg.get_destination() != self.source_port {
            return None;
        }
        let flags = seg.get_flags();
        let reply = TcpReplyFlags {
            syn: flags & TcpFlags::SYN != 0,
            ack: flags & TcpFlags::ACK != 0,
            rst: flags & TcpFlags::RST != 0,
        };
        Some((reply, seg.get_acknowledgement()))
    }
}

/// Send a SYN and wait for the matching reply. Blocking.
pub fn send_syn(probe: &SynProbe, timeout: Duration) -> Result<(Option<TcpReplyFlags>, Duration), ScanError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::TCP))
        .map_err(|e| ScanError::from_io("tcp raw socket", e))?;
    let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(probe.target), 0));

    let sent_at = Instant::now();
    if let Err(e) = socket.send_to(&probe.syn(), &dest) {
        debug!(target = %probe.target, port = probe.target_port, error = %e, "syn send failed");
        return Ok((None, sent_at.elapsed()));
    }

    let deadline = sent_at + timeout;
    let mut buf = [0u8; 1500];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok((None, sent_at.elapsed()));
        }
        let remaining = (deadline - now).max(Duration::from_millis(1));
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ScanError::from_io("tcp raw read timeout", e))?;
        match (&socket).read(&mut buf) {
            Ok(n) => {
                let Some((flags, their_ack)) = probe.match_reply(&buf[..n]) else {
                    continue;
                };
                let rtt = sent_at.elapsed();
                if flags.syn && flags.ack {
                    if let Err(e) = socket.send_to(&probe.rst(their_ack), &dest) {
                        debug!(target = %probe.target, error = %e, "rst send failed");
                    }
                }
                return Ok((Some(flags), rtt));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!(target = %probe.target, error = %e, "raw tcp receive failed");
                return Ok((None, sent_at.elapsed()));
            }
        }
    }
}

/// Half-open scan: SYN+ACK is `open`, RST is `closed`, silence is `filtered`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSyn;

#[async_trait]
impl ProbeStrategy for TcpSyn {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let target = ipv4_target(&unit, "syn scan")?;
        let Some(target_port) = unit.port() else {
            return Err(ScanError::Unsupported {
                operation: "syn scan",
                target: unit.to_string(),
            });
        };
        let source = match source_addr_for(IpAddr::V4(target)) {
            Ok(IpAddr::V4(v4)) => v4,
            Ok(_) => Ipv4Addr::UNSPECIFIED,
            Err(e) => return Err(ScanError::from_io("syn source address", e)),
        };
        // ThreadRng is !Send; it must be dropped before the await below.
        let probe = {
            let mut rng = rand::thread_rng();
            SynProbe {
                source,
                target,
                source_port: rng.gen_range(40_000..60_000),
                target_port,
                sequence: rng.gen(),
            }
        };

        let (reply, rtt) = tokio::task::spawn_blocking(move || send_syn(&probe, timeout)).await??;
        let state = syn_state(reply);
        debug!(%unit, ?reply, %state, "syn probe");
        let mut outcome = ProbeOutcome::new(unit, Protocol::Tcp, state);
        if reply.is_some() {
            outcome = outcome.with_rtt(rtt);
        }
        Ok(Outcome::Verdict(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::MutableIpv4Packet;

    const ME: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const TARGET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    fn probe() -> SynProbe {
        SynProbe {
            source: ME,
            target: TARGET,
            source_port: 45_000,
            target_port: 22,
            sequence: 1000,
        }
    }

    /// A reply as the target would send it: ports and addresses swapped.
    fn reply(flags: u8, ack: u32) -> Vec<u8> {
        let mirrored = SynProbe {
            source: TARGET,
            target: ME,
            source_port: 22,
            target_port: 45_000,
            sequence: 5000,
        };
        let seg = mirrored.segment(flags, 5000, ack);
        let mut buf = vec![0u8; 20 + seg.len()];
        let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((20 + seg.len()) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(TARGET);
        ip.set_destination(ME);
        ip.set_payload(&seg);
        buf
    }

    #[test]
    fn syn_segment_has_valid_checksum() {
        let bytes = probe().syn();
        let seg = TcpPacket::new(&bytes).unwrap();
        assert_eq!(seg.get_flags() & TcpFlags::SYN, TcpFlags::SYN);
        assert_eq!(tcp::ipv4_checksum(&seg, &ME, &TARGET), seg.get_checksum());
    }

    #[test]
    fn synack_reply_is_open_and_rst_uses_their_ack() {
        let dg = reply((TcpFlags::SYN | TcpFlags::ACK) as u8, 1001);
        let (flags, ack) = probe().match_reply(&dg).unwrap();
        assert_eq!(syn_state(Some(flags)), crate::types::PortState::Open);
        let rst = probe().rst(ack);
        let seg = TcpPacket::new(&rst).unwrap();
        assert_eq!(seg.get_sequence(), 1001);
        assert_eq!(seg.get_flags() & TcpFlags::RST, TcpFlags::RST);
    }

    #[test]
    fn rstack_reply_is_closed() {
        let dg = reply((TcpFlags::RST | TcpFlags::ACK) as u8, 1001);
        let (flags, _) = probe().match_reply(&dg).unwrap();
        assert_eq!(syn_state(Some(flags)), crate::types::PortState::Closed);
    }

    #[test]
    fn unrelated_segments_are_ignored() {
        let mut other = probe();
        other.source_port = 45_001;
        let dg = reply((TcpFlags::SYN | TcpFlags::ACK) as u8, 1001);
        assert!(other.match_reply(&dg).is_none());
        assert!(probe().match_reply(&dg[..24]).is_none());
    }

    #[tokio::test]
    async fn probe_future_can_be_spawned() {
        let unit = ScanUnit::service(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 22);
        let res = tokio::spawn(async move { TcpSyn.probe(unit, Duration::from_millis(10)).await })
            .await
            .unwrap();
        assert!(matches!(res, Err(ScanError::Unsupported { .. })));
    }
}
