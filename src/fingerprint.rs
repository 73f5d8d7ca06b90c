//! Coarse OS estimate from the TTL observed on ICMP echo replies.

use std::net::IpAddr;
use std::time::Duration;

use tracing::debug;

use crate::error::ScanError;
use crate::probe::icmp::{self, IcmpReplyKind};
use crate::types::OsFingerprint;

/// Echoes sent per estimate.
pub const SAMPLES: usize = 3;
/// TTL requested on the outbound echoes. Replies carry the responder's own TTL.
pub const REQUESTED_TTL: u8 = 128;

pub const UNKNOWN: &str = "Unknown";

/// Bucket the mean of the observed TTLs. No samples means `Unknown`.
pub fn estimate(observed: &[u8]) -> OsFingerprint {
    if observed.is_empty() {
        return OsFingerprint {
            label: UNKNOWN.to_string(),
            sampled_ttl: None,
        };
    }
    let sum: u32 = observed.iter().map(|&t| u32::from(t)).sum();
    let mean = sum as f64 / observed.len() as f64;
    let label = if mean <= 64.0 {
        "Linux/Unix"
    } else if mean <= 128.0 {
        "Windows"
    } else {
        "Cisco/Network Device"
    };
    OsFingerprint {
        label: label.to_string(),
        sampled_ttl: Some(mean.round() as u8),
    }
}

/// Send [`SAMPLES`] echoes to `target` and estimate its OS from the replies.
///
/// Silence is a definitive `Unknown`, not a reason to retry. Only a missing
/// raw socket is an error.
pub async fn fingerprint_os(target: IpAddr, timeout: Duration) -> Result<OsFingerprint, ScanError> {
    let IpAddr::V4(v4) = target else {
        return Err(ScanError::Unsupported {
            operation: "os fingerprint",
            target: target.to_string(),
        });
    };
    let mut observed = Vec::with_capacity(SAMPLES);
    for _ in 0..SAMPLES {
        if let Some(reply) = icmp::echo(v4, Some(REQUESTED_TTL), timeout).await? {
            if reply.kind == IcmpReplyKind::EchoReply && reply.source == v4 {
                observed.push(reply.ttl);
            }
        }
    }
    let fp = estimate(&observed);
    debug!(%target, ?observed, label = %fp.label, "os fingerprint");
    Ok(fp)
}
