use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

use super::{service_addr, ProbeStrategy};
use crate::classify::{connect_state, ConnectResponse};
use crate::error::ScanError;
use crate::types::{Outcome, ProbeOutcome, Protocol, ScanUnit};

/// Full OS-level TCP handshake, bounded by `timeout`.
///
/// On success the stream is handed back so a banner grab can reuse it.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> (ConnectResponse, Option<TcpStream>, Duration) {
    let start = Instant::now();
    let res = time::timeout(timeout, TcpStream::connect(addr)).await;
    let elapsed = start.elapsed();
    match res {
        Ok(Ok(stream)) => (ConnectResponse::Established, Some(stream), elapsed),
        Ok(Err(e)) => (ConnectResponse::from_io(&e), None, elapsed),
        Err(_) => (ConnectResponse::TimedOut, None, elapsed),
    }
}

/// TCP connect scan: `open` / `closed` / `filtered`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnect;

#[async_trait]
impl ProbeStrategy for TcpConnect {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn probe(&self, unit: ScanUnit, timeout: Duration) -> Result<Outcome, ScanError> {
        let addr = service_addr(&unit, "tcp connect")?;
        // The stream, if any, is dropped here and the connection closed.
        let (response, _stream, rtt) = connect(addr, timeout).await;
        let state = connect_state(response);
        debug!(%unit, ?response, %state, "tcp connect");
        Ok(Outcome::Verdict(
            ProbeOutcome::new(unit, Protocol::Tcp, state).with_rtt(rtt),
        ))
    }
}
