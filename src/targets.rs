//! Target expansion and input validation.
//!
//! Everything here runs before a single probe is dispatched: a malformed
//! address, CIDR, or port expression is a [`ValidationError`], never an empty
//! scan.

use std::collections::BTreeSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::Context;
use ipnet::IpNet;

use crate::error::{ValidationError, ValidationKind};

/// Lazy, restartable sequence of host addresses. Cloning restarts from the clone point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRange {
    next: u128,
    last: u128,
    v6: bool,
    exhausted: bool,
}

impl HostRange {
    fn v4(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        Self {
            next: u128::from(u32::from(first)),
            last: u128::from(u32::from(last)),
            v6: false,
            exhausted: u32::from(first) > u32::from(last),
        }
    }

    fn v6(first: Ipv6Addr, last: Ipv6Addr) -> Self {
        Self {
            next: u128::from(first),
            last: u128::from(last),
            v6: true,
            exhausted: u128::from(first) > u128::from(last),
        }
    }

    fn empty() -> Self {
        Self {
            next: 1,
            last: 0,
            v6: false,
            exhausted: true,
        }
    }

    /// Number of addresses not yet yielded, saturating at `u128::MAX`.
    pub fn remaining(&self) -> u128 {
        if self.exhausted {
            0
        } else {
            (self.last - self.next).saturating_add(1)
        }
    }

    fn to_addr(&self, n: u128) -> IpAddr {
        if self.v6 {
            IpAddr::V6(Ipv6Addr::from(n))
        } else {
            // Values in a v4 range always fit in 32 bits.
            IpAddr::V4(Ipv4Addr::from(n as u32))
        }
    }
}

impl Iterator for HostRange {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        if self.exhausted {
            return None;
        }
        let addr = self.to_addr(self.next);
        if self.next == self.last {
            self.exhausted = true;
        } else {
            self.next += 1;
        }
        Some(addr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

/// Largest number of hosts a single target expression may expand to: an IPv4
/// /16 or an IPv6 /112.
pub const MAX_TARGET_HOSTS: u128 = 1 << 16;

/// Expand a CIDR block or a single address into its scannable host addresses.
///
/// Host bits in a CIDR are ignored (`10.0.0.5/24` scans `10.0.0.0/24`). For
/// IPv4 prefixes shorter than /31 the network and broadcast addresses are
/// skipped. Ranges above [`MAX_TARGET_HOSTS`] are rejected.
pub fn expand_targets(cidr_or_host: &str) -> Result<HostRange, ValidationError> {
    let input = cidr_or_host.trim();
    if input.contains('/') {
        let net: IpNet = input
            .parse()
            .map_err(|_| ValidationError::new(ValidationKind::Cidr, cidr_or_host))?;
        let range = expand_net(net.trunc());
        if range.remaining() > MAX_TARGET_HOSTS {
            return Err(ValidationError::new(ValidationKind::TooManyHosts, cidr_or_host));
        }
        return Ok(range);
    }
    let ip: IpAddr = input
        .parse()
        .map_err(|_| ValidationError::new(ValidationKind::Address, cidr_or_host))?;
    Ok(match ip {
        IpAddr::V4(v4) => HostRange::v4(v4, v4),
        IpAddr::V6(v6) => HostRange::v6(v6, v6),
    })
}

fn expand_net(net: IpNet) -> HostRange {
    match net {
        IpNet::V4(n4) => {
            let start = u32::from(n4.network());
            let end = u32::from(n4.broadcast());
            if n4.prefix_len() >= 31 {
                HostRange::v4(n4.network(), n4.broadcast())
            } else if end <= start + 1 {
                HostRange::empty()
            } else {
                HostRange::v4(Ipv4Addr::from(start + 1), Ipv4Addr::from(end - 1))
            }
        }
        IpNet::V6(n6) => HostRange::v6(n6.network(), n6.broadcast()),
    }
}

/// Parse a port expression (`"80,443"`, `"1-1024"`, `"22,8000-8010"`) into a
/// sorted, de-duplicated list of ports in `1..=65535`.
pub fn expand_ports(expression: &str) -> Result<Vec<u16>, ValidationError> {
    let mut ports = BTreeSet::new();
    collect_ports(expression, &mut ports)?;
    Ok(ports.into_iter().collect())
}

fn collect_ports(expression: &str, out: &mut BTreeSet<u16>) -> Result<(), ValidationError> {
    let syntax = || ValidationError::new(ValidationKind::PortSyntax, expression);
    if expression.trim().is_empty() {
        return Err(syntax());
    }
    for part in expression.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(syntax());
        }
        if let Some((a, b)) = part.split_once('-') {
            let start = parse_port(a.trim(), part)?;
            let end = parse_port(b.trim(), part)?;
            if start > end {
                return Err(ValidationError::new(ValidationKind::PortRange, part));
            }
            out.extend(start..=end);
        } else {
            out.insert(parse_port(part, part)?);
        }
    }
    Ok(())
}

fn parse_port(s: &str, context: &str) -> Result<u16, ValidationError> {
    let val: u32 = s
        .parse()
        .map_err(|_| ValidationError::new(ValidationKind::PortSyntax, context))?;
    if val == 0 || val > 65535 {
        return Err(ValidationError::new(ValidationKind::PortRange, context));
    }
    Ok(val as u16)
}

/// Parse a ports list with one expression per line; `#` starts a comment.
pub fn parse_ports_list(s: &str) -> Result<Vec<u16>, ValidationError> {
    let mut ports = BTreeSet::new();
    for raw_line in s.lines() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        collect_ports(line, &mut ports)?;
    }
    if ports.is_empty() {
        return Err(ValidationError::new(ValidationKind::PortSyntax, s));
    }
    Ok(ports.into_iter().collect())
}

/// Load a ports list file.
pub fn load_ports_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    Ok(parse_ports_list(&content)?)
}

/// Validate a DNS hostname: at most 255 characters, labels of 1..=63
/// alphanumerics or hyphens that neither start nor end with a hyphen.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    let err = || ValidationError::new(ValidationKind::Hostname, hostname);
    if hostname.is_empty() || hostname.len() > 255 {
        return Err(err());
    }
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    let label_ok = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    };
    if name.split('.').all(label_ok) {
        Ok(())
    } else {
        Err(err())
    }
}

/// Reject shell metacharacters and line breaks; returns the trimmed input.
pub fn sanitize_input(input: &str) -> Result<&str, ValidationError> {
    const FORBIDDEN: &[char] = &['&', '|', ';', '$', '`', '\n', '\r'];
    if input.contains(FORBIDDEN) {
        return Err(ValidationError::new(ValidationKind::UnsafeInput, input));
    }
    Ok(input.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_mixed_port_expression() {
        assert_eq!(
            expand_ports("80,22,1000-1002").unwrap(),
            vec![22, 80, 1000, 1001, 1002]
        );
    }

    #[test]
    fn dedups_overlapping_ranges() {
        assert_eq!(expand_ports("8000-8002, 8001,80").unwrap(), vec![80, 8000, 8001, 8002]);
    }

    #[test]
    fn rejects_out_of_range_and_reversed() {
        assert_eq!(expand_ports("70000").unwrap_err().kind, ValidationKind::PortRange);
        assert_eq!(expand_ports("0").unwrap_err().kind, ValidationKind::PortRange);
        assert_eq!(expand_ports("90-80").unwrap_err().kind, ValidationKind::PortRange);
    }

    #[test]
    fn rejects_garbage_and_empty() {
        for bad in ["", "  ", "http", "80,,443", "1-", "-5", "22;80"] {
            let err = expand_ports(bad).unwrap_err();
            assert!(
                matches!(err.kind, ValidationKind::PortSyntax | ValidationKind::PortRange),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn ports_list_with_comments() {
        let input = "
            # common web ports
            80  # http
            443,8443
            8000-8002   # dev servers
        ";
        assert_eq!(
            parse_ports_list(input).unwrap(),
            vec![80, 443, 8000, 8001, 8002, 8443]
        );
    }

    #[test]
    fn small_cidr_skips_network_and_broadcast() {
        let hosts: Vec<_> = expand_targets("192.168.1.0/30").unwrap().collect();
        assert_eq!(
            hosts,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            ]
        );
    }

    #[test]
    fn host_bits_are_truncated() {
        let range = expand_targets("10.0.0.77/24").unwrap();
        assert_eq!(range.remaining(), 254);
        assert_eq!(range.clone().next(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn single_address_and_point_to_point() {
        let one: Vec<_> = expand_targets("127.0.0.1").unwrap().collect();
        assert_eq!(one, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(expand_targets("10.1.1.0/31").unwrap().count(), 2);
        assert_eq!(expand_targets("::1").unwrap().count(), 1);
    }

    #[test]
    fn range_is_restartable_and_deterministic() {
        let range = expand_targets("172.16.0.0/29").unwrap();
        let first: Vec<_> = range.clone().collect();
        let second: Vec<_> = range.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }

    #[test]
    fn oversized_ranges_are_rejected_before_expansion() {
        for wide in ["2001:db8::/64", "::/0", "2001:db8::/100", "10.0.0.0/8"] {
            assert_eq!(
                expand_targets(wide).unwrap_err().kind,
                ValidationKind::TooManyHosts,
                "{wide}"
            );
        }
        assert_eq!(expand_targets("10.0.0.0/16").unwrap().remaining(), 65_534);
        assert_eq!(expand_targets("2001:db8::/112").unwrap().count(), 65_536);
    }

    #[test]
    fn invalid_targets_are_validation_errors() {
        assert_eq!(expand_targets("10.0.0.0/33").unwrap_err().kind, ValidationKind::Cidr);
        assert_eq!(expand_targets("not-an-ip").unwrap_err().kind, ValidationKind::Address);
    }

    #[test]
    fn hostname_rules() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("example.com.").is_ok());
        assert!(validate_hostname("-bad.example").is_err());
        assert!(validate_hostname("bad_label.example").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
    }

    #[test]
    fn sanitize_rejects_shell_metacharacters() {
        assert_eq!(sanitize_input("  example.org ").unwrap(), "example.org");
        assert!(sanitize_input("example.org; rm -rf /").is_err());
    }
}
