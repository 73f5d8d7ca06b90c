use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::debug;

use super::{service_addr, ProbeStrategy};
use crate::classify::{udp_response_from_io, udp_state, UdpResponse};
use crate::error::ScanError;
use crate::types::{Outcome, ProbeOutcome, Protocol, ScanUnit};

/// DNS query for the root NS set; elicits a reply from most resolvers.
const DNS_PROBE: &[u8] = &[
    0x13, 0x37, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
    0x00, 0x01,
];

/// NTP v3 client request.
const NTP_PROBE: &[u8] = &[
    0x1b, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Payload most likely to elicit an application reply on `port`.
pub fn payload_for(port: u16) -> &'static [u8] {
    match port {
        53 => DNS_PROBE,
        123 => NTP_PROBE,
        _ => &[],
    }
}

/// Send one datagram on a connected socket and wait for data or an ICMP error.
///
/// Returns the response kind plus any reply bytes.
pub async fn exchange(
    addr: SocketAddr,
    payload: &[u8],
    timeout: Duration,
    max_bytes: usize,
) -> Result<(UdpResponse, Vec<u8>, Duration), ScanError> {
    let socket = probe_socket(addr).await?;
    let start = Instant::now();

    // Errors past this point are the network answering, not the environment failing.
    if let Err(e) = socket.connect(addr).await {
        return Ok((response_for_error(&socket, &e), Vec::new(), start.elapsed()));
    }
    let (response, buf) = converse(&socket, payload, timeout, max_bytes).await;
    Ok((response, buf, start.elapsed()))
}

/// Unconnected socket of the right family with ICMP error reporting enabled.
async fn probe_socket(addr: SocketAddr) -> Result<UdpSocket, ScanError> {
    let bind: SocketAddr = match addr.ip() {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ScanError::from_io("udp bind", e))?;
    #[cfg(target_os = "linux")]
    if let Err(e) = errqueue::enable(&socket, addr.is_ipv6()) {
        debug!(error = %e, "icmp error reporting unavailable");
    }
    Ok(socket)
}

async fn converse(socket: &UdpSocket, payload: &[u8], timeout: Duration, max_bytes: usize) -> (UdpResponse, Vec<u8>) {
    if let Err(e) = socket.send(payload).await {
        return (response_for_error(socket, &e), Vec::new());
    }
    let mut buf = vec![0u8; max_bytes.max(1)];
    match time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            (UdpResponse::Data, buf)
        }
        Ok(Err(e)) => (response_for_error(socket, &e), Vec::new()),
        Err(_) => (UdpResponse::Silent, Vec::new()),
    }
}

/// Prefer the ICMP type and code the kernel queued over the folded errno.
fn response_for_error(socket: &UdpSocket, err: &io::Error) -> UdpResponse {
    #[cfg(target_os = "linux")]
    if let Some(response) = errqueue::take(socket) {
        return response;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = socket;
    udp_response_from_io(err)
}

/// `IP_RECVERR` / `IPV6_RECVERR`: the kernel keeps each ICMP error with its
/// original type and code on the socket's error queue.
#[cfg(target_os = "linux")]
mod errqueue {
    use std::io;
    use std::mem;
    use std::os::fd::AsRawFd;

    use crate::classify::{icmpv6_as_v4, UdpResponse};

    const ORIGIN_ICMP: u8 = 2;
    const ORIGIN_ICMP6: u8 = 3;
    /// `struct sock_extended_err`: errno (4), origin, type, code, pad, info (4), data (4).
    const EXTENDED_ERR_LEN: usize = 16;

    pub fn enable(socket: &impl AsRawFd, v6: bool) -> io::Result<()> {
        let (level, name) = if v6 {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVERR)
        } else {
            (libc::IPPROTO_IP, libc::IP_RECVERR)
        };
        let on: libc::c_int = 1;
        // SAFETY: `on` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                (&on as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Drain the error queue and return the first ICMP-originated report.
    pub fn take(socket: &impl AsRawFd) -> Option<UdpResponse> {
        for _ in 0..8 {
            let (origin, icmp_type, code) = recv_one(socket.as_raw_fd())?;
            match origin {
                ORIGIN_ICMP => return Some(UdpResponse::Icmp { icmp_type, code }),
                ORIGIN_ICMP6 => return Some(icmpv6_as_v4(icmp_type, code)),
                _ => {}
            }
        }
        None
    }

    fn recv_one(fd: libc::c_int) -> Option<(u8, u8, u8)> {
        let mut data = [0u8; 64];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        // u64 storage keeps the control buffer aligned for cmsghdr.
        let mut control = [0u64; 64];
        // SAFETY: msghdr is plain data; every pointer set below stays valid
        // for the duration of recvmsg.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        // SAFETY: fd is an open socket owned by the caller; msg is initialised above.
        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if n < 0 {
            return None;
        }

        // SAFETY: the CMSG_* walkers stay within msg_controllen as filled in by the kernel.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                let recverr = (hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_RECVERR)
                    || (hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR);
                if recverr && hdr.cmsg_len as usize >= libc::CMSG_LEN(EXTENDED_ERR_LEN as u32) as usize {
                    let err = std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), EXTENDED_ERR_LEN);
                    return Some((err[4], err[5], err[6]));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        // A queued error without a readable extended header still consumed an entry.
        Some((0, 0, 0))
    }
}

/// UDP scan: `open`, `closed`, `filtered` or `open|filtered`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpProbe;

#[async_trait]
impl ProbeStrategy for UdpProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let addr = service_addr(&unit, "udp probe")?;
        let (response, _, rtt) = exchange(addr, payload_for(addr.port()), timeout, 512).await?;
        let state = udp_state(response);
        debug!(%unit, ?response, %state, "udp probe");
        let mut outcome = ProbeOutcome::new(unit, Protocol::Udp, state);
        if response != UdpResponse::Silent {
            outcome = outcome.with_rtt(rtt);
        }
        Ok(Outcome::Verdict(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortState;

    fn unit(port: u16) -> ScanUnit {
        ScanUnit::service(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn silent_listener_is_open_or_filtered() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let outcome = UdpProbe
            .probe(unit(port), Duration::from_millis(200))
            .await
            .unwrap()
            .verdict()
            .unwrap();
        assert_eq!(outcome.state, PortState::OpenOrFiltered);
    }

    #[tokio::test]
    async fn unbound_port_is_closed() {
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let outcome = UdpProbe
            .probe(unit(port), Duration::from_millis(500))
            .await
            .unwrap()
            .verdict()
            .unwrap();
        assert_eq!(outcome.state, PortState::Closed);
    }

    /// ICMP destination-unreachable quoting a UDP datagram `from -> to`, as a
    /// router in the path would send it.
    #[cfg(target_os = "linux")]
    fn unreachable_for(code: u8, from: SocketAddr, to: SocketAddr) -> Vec<u8> {
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (from.ip(), to.ip()) else {
            panic!("ipv4 only");
        };
        let mut msg = vec![3, code, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&[0x45, 0, 0, 28, 0, 0, 0x40, 0, 64, 17, 0, 0]);
        msg.extend_from_slice(&src.octets());
        msg.extend_from_slice(&dst.octets());
        msg.extend_from_slice(&from.port().to_be_bytes());
        msg.extend_from_slice(&to.port().to_be_bytes());
        msg.extend_from_slice(&[0, 8, 0, 0]);
        let sum = pnet::packet::util::checksum(&msg, 1);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        msg
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn icmp_unreachable_codes_are_read_from_the_error_queue() {
        use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};

        let raw = match Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4)) {
            Ok(raw) => raw,
            // Needs CAP_NET_RAW to forge the ICMP error.
            Err(_) => return,
        };
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap();

        let expected = [
            (1, PortState::Filtered),
            (2, PortState::Filtered),
            (3, PortState::Closed),
            (9, PortState::Filtered),
            (10, PortState::Filtered),
            (13, PortState::Filtered),
        ];
        for (code, state) in expected {
            let socket = probe_socket(target).await.unwrap();
            socket.connect(target).await.unwrap();
            let local = socket.local_addr().unwrap();
            raw.send_to(&unreachable_for(code, local, target), &SockAddr::from(target))
                .unwrap();

            let (response, _) = converse(&socket, b"", Duration::from_millis(500), 64).await;
            assert_eq!(response, UdpResponse::Icmp { icmp_type: 3, code }, "code {code}");
            assert_eq!(udp_state(response), state, "code {code}");
        }
    }

    #[tokio::test]
    async fn echoing_service_is_open() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n.max(1)], peer).await;
            }
        });
        let outcome = UdpProbe
            .probe(unit(port), Duration::from_secs(1))
            .await
            .unwrap()
            .verdict()
            .unwrap();
        assert_eq!(outcome.state, PortState::Open);
    }
}
