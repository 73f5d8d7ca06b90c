//! Error families of the probing engine.
//!
//! Malformed input is a [`ValidationError`] and is raised before any probe is
//! dispatched. A [`ScanError`] means the scan could not run in this
//! environment (no raw socket, no interface, no file descriptors). Expected
//! network failures (timeouts, refusals, unreachables) are never errors; they
//! are folded into a [`crate::types::PortState`].

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// What part of the input failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    Cidr,
    TooManyHosts,
    Address,
    Hostname,
    PortSyntax,
    PortRange,
    Protocol,
    Concurrency,
    Timeout,
    MaxHops,
    RecordType,
    UnsafeInput,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationKind::Cidr => "invalid CIDR",
            ValidationKind::TooManyHosts => "target range exceeds the host limit",
            ValidationKind::Address => "invalid address",
            ValidationKind::Hostname => "invalid hostname",
            ValidationKind::PortSyntax => "invalid port syntax",
            ValidationKind::PortRange => "port out of range",
            ValidationKind::Protocol => "unsupported protocol",
            ValidationKind::Concurrency => "concurrency must be at least 1",
            ValidationKind::Timeout => "timeout must be positive",
            ValidationKind::MaxHops => "max hops must be within 1..=255",
            ValidationKind::RecordType => "unknown DNS record type",
            ValidationKind::UnsafeInput => "input contains a forbidden character",
        };
        f.write_str(s)
    }
}

/// Input rejected before probing started.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {input:?}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub input: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }
}

/// The scan could not run; fatal to the phase that hit it.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("permission denied for {operation}: {reason}")]
    Permission { operation: &'static str, reason: String },

    #[error("resource unavailable for {operation}: {source}")]
    Resource {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no local interface can reach {target} on the same segment")]
    Interface { target: String },

    #[error("{operation} does not support {target}")]
    Unsupported { operation: &'static str, target: String },

    #[error("probe worker failed: {0}")]
    Worker(String),
}

impl ScanError {
    /// Classify an I/O failure raised while acquiring a socket or packet handle.
    pub fn from_io(operation: &'static str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            ScanError::Permission {
                operation,
                reason: format!("{err} (raw sockets need root or CAP_NET_RAW)"),
            }
        } else {
            ScanError::Resource {
                operation,
                source: err,
            }
        }
    }

    /// True when the failure came from malformed input rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(self, ScanError::Validation(_))
    }
}

impl From<tokio::task::JoinError> for ScanError {
    fn from(err: tokio::task::JoinError) -> Self {
        ScanError::Worker(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_reported_as_permission() {
        let err = ScanError::from_io(
            "icmp socket",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, ScanError::Permission { .. }));
        assert!(!err.is_validation());
    }

    #[test]
    fn other_io_failures_are_resources() {
        let err = ScanError::from_io("udp bind", io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(err, ScanError::Resource { .. }));
    }

    #[test]
    fn validation_error_keeps_input_verbatim() {
        let err: ScanError = ValidationError::new(ValidationKind::PortRange, "70000").into();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "port out of range: \"70000\"");
    }
}
