//! Library crate for hosthawk-rs: the concurrent probing engine and its collaborators.
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod netdetect;
pub mod probe;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod session;
pub mod targets;
pub mod trace;
pub mod types;

pub use dispatch::{PhaseEnd, PhaseReport, ProgressSink, ResultSink};
pub use dns::{dns_lookup, zone_transfer};
pub use error::{ScanError, ValidationError, ValidationKind};
pub use fingerprint::fingerprint_os;
pub use probe::grab_banner;
pub use scanner::{run_host_discovery, run_port_scan};
pub use session::ScanSession;
pub use targets::{expand_ports, expand_targets};
pub use trace::traceroute;
pub use types::{Outcome, PortState, ProbeOutcome, Protocol, ScanMode, ScanUnit};
