//! Hop-by-hop TTL tracer built on ICMP echo.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::debug;

use crate::error::{ScanError, ValidationError, ValidationKind};
use crate::probe::icmp::{self, EchoRequest, IcmpReply};
use crate::types::Hop;

pub const DEFAULT_MAX_HOPS: usize = 30;

pub fn validate_max_hops(max_hops: usize) -> Result<u8, ValidationError> {
    u8::try_from(max_hops)
        .ok()
        .filter(|&h| h >= 1)
        .ok_or_else(|| ValidationError::new(ValidationKind::MaxHops, max_hops.to_string()))
}

/// Walk TTLs `1..=max_hops`, one best-effort probe each.
///
/// Silent hops are skipped. The walk stops at the first reply from `target`.
pub fn trace_with<F>(target: Ipv4Addr, max_hops: u8, mut probe: F) -> Result<Vec<Hop>, ScanError>
where
    F: FnMut(u8) -> Result<Option<IcmpReply>, ScanError>,
{
    let mut hops = Vec::new();
    for ttl in 1..=max_hops {
        let Some(reply) = probe(ttl)? else {
            debug!(%target, ttl, "no reply");
            continue;
        };
        debug!(%target, ttl, responder = %reply.source, kind = ?reply.kind, "hop");
        hops.push(Hop {
            ttl,
            address: IpAddr::V4(reply.source),
            rtt: reply.rtt,
        });
        if reply.source == target {
            break;
        }
    }
    Ok(hops)
}

pub async fn traceroute(target: IpAddr, max_hops: usize, timeout: Duration) -> Result<Vec<Hop>, ScanError> {
    let max_hops = validate_max_hops(max_hops)?;
    let IpAddr::V4(v4) = target else {
        return Err(ScanError::Unsupported {
            operation: "traceroute",
            target: target.to_string(),
        });
    };
    tokio::task::spawn_blocking(move || {
        trace_with(v4, max_hops, |ttl| {
            icmp::send_echo(&EchoRequest::new(v4, Some(ttl)), timeout)
        })
    })
    .await?
}
