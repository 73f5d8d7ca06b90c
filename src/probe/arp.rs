//! ARP who-has on the local broadcast domain.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use tracing::debug;

use super::{ipv4_target, ProbeStrategy};
use crate::classify::discovery_state;
use crate::error::ScanError;
use crate::types::{Outcome, ProbeOutcome, Protocol, ScanUnit};

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

/// Ethernet frame carrying an ARP request for `target`.
pub fn arp_request(source_mac: MacAddr, source_ip: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let mut arp_buf = [0u8; ARP_PACKET_LEN];
    if let Some(mut arp) = MutableArpPacket::new(&mut arp_buf) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    if let Some(mut eth) = MutableEthernetPacket::new(&mut frame) {
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(source_mac);
        eth.set_ethertype(EtherTypes::Arp);
        eth.set_payload(&arp_buf);
    }
    frame
}

/// Hardware address of `target` if `frame` is its ARP reply.
pub fn match_arp_reply(frame: &[u8], target: Ipv4Addr) -> Option<MacAddr> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    (arp.get_operation() == ArpOperations::Reply && arp.get_sender_proto_addr() == target)
        .then(|| arp.get_sender_hw_addr())
}

/// Pick the up, non-loopback interface whose IPv4 network contains `target`.
pub fn interface_for(target: Ipv4Addr, preferred: Option<&str>) -> Option<(NetworkInterface, MacAddr, Ipv4Addr)> {
    datalink::interfaces().into_iter().find_map(|iface| {
        if !iface.is_up() || iface.is_loopback() {
            return None;
        }
        if preferred.is_some_and(|name| name != iface.name) {
            return None;
        }
        let mac = iface.mac?;
        let source = iface.ips.iter().find_map(|net| match net.ip() {
            IpAddr::V4(v4) if net.contains(IpAddr::V4(target)) => Some(v4),
            _ => None,
        })?;
        Some((iface, mac, source))
    })
}

/// Broadcast one ARP request and wait for the target's reply. Blocking.
pub fn send_arp(
    iface: &NetworkInterface,
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target: Ipv4Addr,
    timeout: Duration,
) -> Result<Option<(MacAddr, Duration)>, ScanError> {
    let config = datalink::Config {
        read_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(ScanError::Unsupported {
                operation: "arp request",
                target: iface.name.clone(),
            })
        }
        Err(e) => return Err(ScanError::from_io("arp datalink channel", e)),
    };

    let sent_at = Instant::now();
    match tx.send_to(&arp_request(source_mac, source_ip, target), None) {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            debug!(%target, error = %e, "arp send failed");
            return Ok(None);
        }
        None => return Ok(None),
    }

    let deadline = sent_at + timeout;
    while Instant::now() < deadline {
        match rx.next() {
            Ok(frame) => {
                if let Some(mac) = match_arp_reply(frame, target) {
                    return Ok(Some((mac, sent_at.elapsed())));
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) => {
                debug!(%target, error = %e, "arp receive failed");
                return Ok(None);
            }
        }
    }
    Ok(None)
}

/// Host discovery by ARP. Captures the responder's hardware address.
#[derive(Debug, Clone, Default)]
pub struct ArpRequest {
    /// Restrict to a named interface; otherwise pick the one on the target's segment.
    pub interface: Option<String>,
}

impl ArpRequest {
    pub fn on(interface: impl Into<String>) -> Self {
        Self {
            interface: Some(interface.into()),
        }
    }
}

#[async_trait]
impl ProbeStrategy for ArpRequest {
    fn protocol(&self) -> Protocol {
        Protocol::Arp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let target = ipv4_target(&unit, "arp request")?;
        let (iface, mac, source) = interface_for(target, self.interface.as_deref())
            .ok_or_else(|| ScanError::Interface {
                target: target.to_string(),
            })?;
        let reply = tokio::task::spawn_blocking(move || send_arp(&iface, mac, source, target, timeout)).await??;
        Ok(match (discovery_state(reply.is_some()), reply) {
            (Some(state), Some((peer, rtt))) => {
                debug!(%unit, %peer, "arp reply");
                Outcome::Verdict(
                    ProbeOutcome::new(unit, Protocol::Arp, state)
                        .with_rtt(rtt)
                        .with_peer_mac(peer.to_string()),
                )
            }
            _ => Outcome::NoVerdict,
        })
    }
}
