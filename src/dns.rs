//! DNS record lookups and an opportunistic zone transfer.
//!
//! Each record type is queried independently; a failure for one type never
//! stops the others. When the zone has NS records, an AXFR is attempted
//! against each nameserver in order and the first success wins.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_resolver::proto::rr::{Name, RecordType};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{ValidationError, ValidationKind};
use crate::targets::{sanitize_input, validate_hostname};

pub const DEFAULT_RECORD_TYPES: &[RecordType] = &[
    RecordType::A,
    RecordType::AAAA,
    RecordType::MX,
    RecordType::NS,
    RecordType::TXT,
    RecordType::SOA,
    RecordType::CNAME,
];

const DNS_PORT: u16 = 53;

/// Records that came back from a successful AXFR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneTransfer {
    pub nameserver: String,
    pub records: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsReport {
    /// Record type name to answers; types with no answer map to an empty list.
    pub records: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_transfer: Option<ZoneTransfer>,
}

/// Parse a comma-separated list such as `A,MX,txt`.
pub fn parse_record_types(list: &str) -> Result<Vec<RecordType>, ValidationError> {
    let mut types = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let rt = RecordType::from_str(&token.to_ascii_uppercase())
            .map_err(|_| ValidationError::new(ValidationKind::RecordType, token))?;
        if !types.contains(&rt) {
            types.push(rt);
        }
    }
    if types.is_empty() {
        return Err(ValidationError::new(ValidationKind::RecordType, list));
    }
    Ok(types)
}

fn resolver(timeout: Duration) -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 1;
    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
}

fn strip_root(name: String) -> String {
    match name.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}

/// Query every record type for `domain`, then try a zone transfer if NS records exist.
pub async fn dns_lookup(
    domain: &str,
    record_types: &[RecordType],
    timeout: Duration,
) -> Result<DnsReport, ValidationError> {
    let domain = sanitize_input(domain.trim())?;
    validate_hostname(domain)?;
    Ok(lookup_with(&resolver(timeout), domain, record_types, timeout).await)
}

async fn lookup_with(
    resolver: &TokioAsyncResolver,
    domain: &str,
    record_types: &[RecordType],
    timeout: Duration,
) -> DnsReport {
    let mut report = DnsReport::default();
    for &rt in record_types {
        let answers = match resolver.lookup(domain, rt).await {
            Ok(lookup) => lookup.iter().map(|rdata| rdata.to_string()).collect(),
            Err(e) => {
                debug!(%domain, record_type = %rt, error = %e, "no answer");
                Vec::new()
            }
        };
        report.records.insert(rt.to_string(), answers);
    }

    let nameservers: Vec<String> = report
        .records
        .get(&RecordType::NS.to_string())
        .map(|ns| ns.iter().cloned().map(strip_root).collect())
        .unwrap_or_default();
    if !nameservers.is_empty() {
        report.zone_transfer = zone_transfer_with(resolver, &nameservers, domain, timeout).await;
    }
    report
}

/// Attempt an AXFR of `domain` against each nameserver in turn.
///
/// Nameservers may be hostnames, addresses, or `address:port`. Returns the
/// first successful transfer; `None` if every server refused or failed.
pub async fn zone_transfer(nameservers: &[String], domain: &str, timeout: Duration) -> Option<ZoneTransfer> {
    zone_transfer_with(&resolver(timeout), nameservers, domain, timeout).await
}

async fn zone_transfer_with(
    resolver: &TokioAsyncResolver,
    nameservers: &[String],
    domain: &str,
    timeout: Duration,
) -> Option<ZoneTransfer> {
    for ns in nameservers {
        let Some(addr) = nameserver_addr(resolver, ns).await else {
            debug!(nameserver = %ns, "nameserver did not resolve");
            continue;
        };
        match time::timeout(timeout, axfr(addr, domain)).await {
            Ok(Ok(records)) if !records.is_empty() => {
                info!(nameserver = %ns, %domain, records = records.len(), "zone transfer succeeded");
                return Some(ZoneTransfer {
                    nameserver: ns.clone(),
                    records,
                });
            }
            Ok(Ok(_)) => debug!(nameserver = %ns, "zone transfer refused"),
            Ok(Err(e)) => debug!(nameserver = %ns, error = %e, "zone transfer failed"),
            Err(_) => debug!(nameserver = %ns, "zone transfer timed out"),
        }
    }
    None
}

async fn nameserver_addr(resolver: &TokioAsyncResolver, ns: &str) -> Option<SocketAddr> {
    if let Ok(addr) = ns.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = ns.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DNS_PORT));
    }
    let ips = resolver.lookup_ip(ns).await.ok()?;
    let ip = ips.iter().next()?;
    Some(SocketAddr::new(ip, DNS_PORT))
}

fn axfr_query(domain: &str) -> anyhow::Result<Vec<u8>> {
    let name = Name::from_ascii(domain)?;
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    msg.add_query(Query::query(name, RecordType::AXFR));
    Ok(msg.to_vec()?)
}

/// One AXFR over TCP. An empty list means the server answered but refused.
async fn axfr(addr: SocketAddr, domain: &str) -> anyhow::Result<Vec<String>> {
    let query = axfr_query(domain)?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_u16(u16::try_from(query.len())?).await?;
    stream.write_all(&query).await?;

    let mut records = Vec::new();
    let mut soa_seen = 0;
    loop {
        let len = stream.read_u16().await?;
        let mut buf = vec![0u8; usize::from(len)];
        stream.read_exact(&mut buf).await?;
        let msg = Message::from_vec(&buf)?;
        if msg.response_code() != ResponseCode::NoError {
            return Ok(Vec::new());
        }
        if msg.answers().is_empty() {
            return Ok(records);
        }
        for record in msg.answers() {
            if record.record_type() == RecordType::SOA {
                soa_seen += 1;
            }
            records.push(record.to_string());
            // The zone is framed by its SOA record at both ends.
            if soa_seen == 2 {
                return Ok(records);
            }
        }
    }
}
