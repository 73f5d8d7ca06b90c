//! Pure mapping from observed responses to [`PortState`].
//!
//! Nothing here touches the network. A response that could not be parsed as
//! the expected layer is represented as "no response" by the caller, so a
//! noisy network degrades to `filtered`/`open|filtered` rather than an error.

use std::io;

use crate::types::PortState;

/// ICMP type for "destination unreachable".
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
/// ICMP unreachable code meaning "port unreachable".
pub const ICMP_PORT_UNREACHABLE: u8 = 3;
/// Unreachable codes that indicate a filtering device: host, protocol,
/// network-admin, host-admin and communication-admin prohibited.
pub const ICMP_FILTERED_CODES: &[u8] = &[1, 2, 9, 10, 13];

/// How an OS-level TCP connect attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResponse {
    Established,
    Refused,
    TimedOut,
    Failed(io::ErrorKind),
}

impl ConnectResponse {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectResponse::Refused,
            io::ErrorKind::TimedOut => ConnectResponse::TimedOut,
            kind => ConnectResponse::Failed(kind),
        }
    }
}

pub fn connect_state(response: ConnectResponse) -> PortState {
    match response {
        ConnectResponse::Established => PortState::Open,
        ConnectResponse::Refused => PortState::Closed,
        ConnectResponse::TimedOut | ConnectResponse::Failed(_) => PortState::Filtered,
    }
}

/// Flags of a TCP segment received in answer to a SYN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpReplyFlags {
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
}

/// Half-open (SYN) verdict. `None` means nothing parsable arrived in time.
pub fn syn_state(reply: Option<TcpReplyFlags>) -> PortState {
    match reply {
        Some(f) if f.syn && f.ack => PortState::Open,
        Some(f) if f.rst => PortState::Closed,
        _ => PortState::Filtered,
    }
}

/// What came back after sending a UDP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpResponse {
    /// The application answered.
    Data,
    /// An ICMP error arrived.
    Icmp { icmp_type: u8, code: u8 },
    /// Nothing (or nothing parsable) within the timeout.
    Silent,
}

pub fn udp_state(response: UdpResponse) -> PortState {
    match response {
        UdpResponse::Data => PortState::Open,
        UdpResponse::Icmp { icmp_type, code } if icmp_type == ICMP_DEST_UNREACHABLE => {
            if code == ICMP_PORT_UNREACHABLE {
                PortState::Closed
            } else if ICMP_FILTERED_CODES.contains(&code) {
                PortState::Filtered
            } else {
                PortState::OpenOrFiltered
            }
        }
        UdpResponse::Icmp { .. } | UdpResponse::Silent => PortState::OpenOrFiltered,
    }
}

/// Best-effort fallback when no ICMP report was queued on the socket: only
/// the error kinds that pin down an unreachable class are mapped. Linux folds
/// codes 1, 10 and 13 into `EHOSTUNREACH`, all of which mean filtered.
pub fn udp_response_from_io(err: &io::Error) -> UdpResponse {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => ICMP_PORT_UNREACHABLE,
        io::ErrorKind::HostUnreachable => 1,
        _ => return UdpResponse::Silent,
    };
    UdpResponse::Icmp {
        icmp_type: ICMP_DEST_UNREACHABLE,
        code,
    }
}

/// Translate an ICMPv6 error into its ICMPv4 destination-unreachable
/// equivalent so one rule table serves both families.
pub fn icmpv6_as_v4(icmp_type: u8, code: u8) -> UdpResponse {
    const V6_DEST_UNREACHABLE: u8 = 1;
    if icmp_type != V6_DEST_UNREACHABLE {
        return UdpResponse::Icmp { icmp_type: u8::MAX, code };
    }
    let code = match code {
        // administratively prohibited, source policy, reject route
        1 | 5 | 6 => 13,
        // address unreachable
        3 => 1,
        4 => ICMP_PORT_UNREACHABLE,
        // no route and anything unassigned
        _ => 0,
    };
    UdpResponse::Icmp {
        icmp_type: ICMP_DEST_UNREACHABLE,
        code,
    }
}

/// ICMP / ARP host discovery: a reply means `up`; silence is not proof of absence.
pub fn discovery_state(replied: bool) -> Option<PortState> {
    replied.then_some(PortState::Up)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_states() {
        assert_eq!(connect_state(ConnectResponse::Established), PortState::Open);
        assert_eq!(connect_state(ConnectResponse::Refused), PortState::Closed);
        assert_eq!(connect_state(ConnectResponse::TimedOut), PortState::Filtered);
        assert_eq!(
            connect_state(ConnectResponse::Failed(io::ErrorKind::HostUnreachable)),
            PortState::Filtered
        );
    }

    #[test]
    fn syn_states() {
        let synack = TcpReplyFlags { syn: true, ack: true, rst: false };
        let rstack = TcpReplyFlags { syn: false, ack: true, rst: true };
        let bare_ack = TcpReplyFlags { syn: false, ack: true, rst: false };
        assert_eq!(syn_state(Some(synack)), PortState::Open);
        assert_eq!(syn_state(Some(rstack)), PortState::Closed);
        assert_eq!(syn_state(Some(bare_ack)), PortState::Filtered);
        assert_eq!(syn_state(None), PortState::Filtered);
    }

    #[test]
    fn udp_port_unreachable_is_closed() {
        let r = UdpResponse::Icmp { icmp_type: 3, code: 3 };
        assert_eq!(udp_state(r), PortState::Closed);
    }

    #[test]
    fn udp_admin_prohibited_is_filtered() {
        for code in [1, 2, 9, 10, 13] {
            let r = UdpResponse::Icmp { icmp_type: 3, code };
            assert_eq!(udp_state(r), PortState::Filtered, "code {code}");
        }
    }

    #[test]
    fn udp_silence_and_oddities_are_open_or_filtered() {
        assert_eq!(udp_state(UdpResponse::Silent), PortState::OpenOrFiltered);
        assert_eq!(
            udp_state(UdpResponse::Icmp { icmp_type: 11, code: 0 }),
            PortState::OpenOrFiltered
        );
        assert_eq!(udp_state(UdpResponse::Data), PortState::Open);
    }

    #[test]
    fn refused_udp_maps_to_port_unreachable() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(udp_state(udp_response_from_io(&err)), PortState::Closed);
        let err = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(udp_state(udp_response_from_io(&err)), PortState::Filtered);
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::PermissionDenied] {
            assert_eq!(udp_response_from_io(&io::Error::from(kind)), UdpResponse::Silent);
        }
    }

    #[test]
    fn icmpv6_unreachables_follow_the_v4_rules() {
        assert_eq!(udp_state(icmpv6_as_v4(1, 4)), PortState::Closed);
        for code in [1, 3, 5, 6] {
            assert_eq!(udp_state(icmpv6_as_v4(1, code)), PortState::Filtered, "code {code}");
        }
        assert_eq!(udp_state(icmpv6_as_v4(1, 0)), PortState::OpenOrFiltered);
        // time exceeded
        assert_eq!(udp_state(icmpv6_as_v4(3, 0)), PortState::OpenOrFiltered);
    }

    #[test]
    fn discovery_never_reports_down() {
        assert_eq!(discovery_state(true), Some(PortState::Up));
        assert_eq!(discovery_state(false), None);
    }
}
