//! Service banner capture.
//!
//! A specialization of the TCP connect probe: once the port is open a
//! port-appropriate greeting is sent and a bounded amount of the reply is
//! read. A missing banner is never an error; it is simply empty.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

use super::{service_addr, tcp, udp, ProbeStrategy};
use crate::classify::connect_state;
use crate::error::ScanError;
use crate::types::{Outcome, PortState, ProbeOutcome, Protocol, ScanUnit};

const HTTP_REQUEST: &[u8] = b"GET / HTTP/1.0\r\n\r\n";

/// Bounds for the secondary banner read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BannerConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_bytes: 1024,
        }
    }
}

/// How to talk to a service to make it identify itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Http,
    Tls,
    /// Read the greeting, send a command, read again.
    Command(&'static [u8]),
    Newline,
}

pub fn greeting_for(port: u16) -> Greeting {
    match port {
        80 | 8000 | 8080 => Greeting::Http,
        443 | 8443 => Greeting::Tls,
        21 => Greeting::Command(b"HELP\r\n"),
        25 | 587 => Greeting::Command(b"HELO hosthawk.local\r\n"),
        _ => Greeting::Newline,
    }
}

/// One read of at most `max` bytes; empty on timeout, EOF or error.
async fn read_some<S: AsyncRead + Unpin>(stream: &mut S, max: usize, timeout: Duration) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    match time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8], timeout: Duration) -> bool {
    matches!(time::timeout(timeout, stream.write_all(bytes)).await, Ok(Ok(())))
}

fn trim(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last().is_some_and(|b| b.is_ascii_whitespace()) {
        bytes.pop();
    }
    let lead = bytes.iter().take_while(|b| b.is_ascii_whitespace()).count();
    bytes.drain(..lead);
    bytes
}

async fn converse<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, greeting: Greeting, cfg: BannerConfig) -> Vec<u8> {
    match greeting {
        Greeting::Http | Greeting::Tls => {
            if !send(stream, HTTP_REQUEST, cfg.timeout).await {
                return Vec::new();
            }
            trim(read_some(stream, cfg.max_bytes, cfg.timeout).await)
        }
        Greeting::Command(cmd) => {
            let mut banner = trim(read_some(stream, cfg.max_bytes, cfg.timeout).await);
            if send(stream, cmd, cfg.timeout).await {
                let room = cfg.max_bytes.saturating_sub(banner.len() + 1);
                let more = trim(read_some(stream, room.max(1), cfg.timeout).await);
                if !more.is_empty() {
                    if !banner.is_empty() {
                        banner.push(b'\n');
                    }
                    banner.extend(more);
                }
            }
            banner
        }
        Greeting::Newline => {
            if !send(stream, b"\r\n", cfg.timeout).await {
                return Vec::new();
            }
            trim(read_some(stream, cfg.max_bytes, cfg.timeout).await)
        }
    }
}

/// Subject of the server certificate, if the peer presented a parsable one.
fn certificate_subject<S>(tls: &tokio_native_tls::TlsStream<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cert = tls.get_ref().peer_certificate().ok()??;
    let der = cert.to_der().ok()?;
    let (_, x509) = x509_parser::parse_x509_certificate(&der).ok()?;
    Some(x509.subject().to_string())
}

async fn tls_banner(stream: TcpStream, host: IpAddr, cfg: BannerConfig) -> Vec<u8> {
    let connector = match native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
    {
        Ok(c) => tokio_native_tls::TlsConnector::from(c),
        Err(e) => {
            debug!(error = %e, "tls connector unavailable");
            return Vec::new();
        }
    };
    let mut tls = match time::timeout(cfg.timeout, connector.connect(&host.to_string(), stream)).await {
        Ok(Ok(tls)) => tls,
        _ => return Vec::new(),
    };
    let mut banner = Vec::new();
    if let Some(subject) = certificate_subject(&tls) {
        banner.extend_from_slice(format!("tls-subject: {subject}").as_bytes());
    }
    let body = converse(&mut tls, Greeting::Tls, cfg).await;
    if !body.is_empty() {
        if !banner.is_empty() {
            banner.push(b'\n');
        }
        banner.extend(body);
    }
    banner.truncate(cfg.max_bytes);
    banner
}

/// Capture a banner from an already-established TCP stream.
pub async fn banner_from_stream(mut stream: TcpStream, addr: SocketAddr, cfg: BannerConfig) -> Vec<u8> {
    match greeting_for(addr.port()) {
        Greeting::Tls => tls_banner(stream, addr.ip(), cfg).await,
        greeting => converse(&mut stream, greeting, cfg).await,
    }
}

/// Connect (TCP) or exchange a datagram (UDP) and return whatever the service says.
///
/// Unreachable, closed or silent services yield an empty banner.
pub async fn grab_banner(target: IpAddr, port: u16, protocol: Protocol, timeout: Duration) -> Vec<u8> {
    let addr = SocketAddr::new(target, port);
    let cfg = BannerConfig {
        timeout,
        ..BannerConfig::default()
    };
    match protocol {
        Protocol::Tcp => match tcp::connect(addr, timeout).await {
            (_, Some(stream), _) => banner_from_stream(stream, addr, cfg).await,
            _ => Vec::new(),
        },
        Protocol::Udp => match udp::exchange(addr, udp::payload_for(port), timeout, cfg.max_bytes).await {
            Ok((_, bytes, _)) => bytes,
            Err(e) => {
                debug!(%addr, error = %e, "udp banner exchange failed");
                Vec::new()
            }
        },
        Protocol::Icmp | Protocol::Arp => Vec::new(),
    }
}

/// TCP connect scan that also records a banner for open ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct BannerGrab {
    pub config: BannerConfig,
}

impl BannerGrab {
    pub fn new(config: BannerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProbeStrategy for BannerGrab {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let addr = service_addr(&unit, "banner grab")?;
        let (response, stream, rtt) = tcp::connect(addr, timeout).await;
        let state = connect_state(response);
        let mut outcome = ProbeOutcome::new(unit, Protocol::Tcp, state).with_rtt(rtt);
        if let (PortState::Open, Some(stream)) = (state, stream) {
            let started = Instant::now();
            let banner = banner_from_stream(stream, addr, self.config).await;
            debug!(%unit, bytes = banner.len(), took = ?started.elapsed(), "banner");
            outcome = outcome.with_banner(banner);
        }
        Ok(Outcome::Verdict(outcome))
    }

    fn budget(&self, timeout: Duration) -> Duration {
        // Connect, then up to two writes and two reads (plus a TLS handshake).
        timeout + self.config.timeout * 5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    async fn serve_once(reply_first: Option<&'static [u8]>, reply_after: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                if let Some(first) = reply_first {
                    let _ = sock.write_all(first).await;
                }
                let mut buf = [0u8; 256];
                if sock.read(&mut buf).await.unwrap_or(0) > 0 {
                    let _ = sock.write_all(reply_after).await;
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn newline_greeting_reads_reply() {
        let port = serve_once(None, b"SSH-2.0-OpenSSH_9.6\r\n").await;
        let banner = grab_banner(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Protocol::Tcp, Duration::from_secs(1)).await;
        assert_eq!(banner, b"SSH-2.0-OpenSSH_9.6");
    }

    #[tokio::test]
    async fn closed_port_has_empty_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let banner = grab_banner(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Protocol::Tcp, Duration::from_millis(300)).await;
        assert!(banner.is_empty());
    }

    #[tokio::test]
    async fn command_greeting_joins_both_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"220 mail ready\r\n").await;
                let mut buf = [0u8; 64];
                if sock.read(&mut buf).await.unwrap_or(0) > 0 {
                    let _ = sock.write_all(b"250 hello\r\n").await;
                }
            }
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut stream = stream;
        let banner = converse(&mut stream, Greeting::Command(b"HELO x\r\n"), BannerConfig::default()).await;
        assert_eq!(banner, b"220 mail ready\n250 hello");
    }

    #[tokio::test]
    async fn banner_grab_strategy_attaches_banner_to_open_ports() {
        let port = serve_once(None, b"hello\n").await;
        let unit = ScanUnit::service(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let outcome = BannerGrab::default()
            .probe(unit, Duration::from_secs(1))
            .await
            .unwrap()
            .verdict()
            .unwrap();
        assert_eq!(outcome.state, PortState::Open);
        assert_eq!(outcome.banner.unwrap().as_bytes(), b"hello");
    }

    #[test]
    fn greetings_by_port() {
        assert_eq!(greeting_for(80), Greeting::Http);
        assert_eq!(greeting_for(443), Greeting::Tls);
        assert!(matches!(greeting_for(25), Greeting::Command(_)));
        assert_eq!(greeting_for(22), Greeting::Newline);
    }

    #[test]
    fn trim_strips_surrounding_whitespace() {
        assert_eq!(trim(b"\r\n 220 ok \r\n".to_vec()), b"220 ok");
        assert!(trim(b"\r\n".to_vec()).is_empty());
    }
}
