//! Error types for endpoints, supervision and the wire protocol

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::ServiceId;

/// Failures while preparing, binding or removing a socket endpoint
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("path {path} is occupied and could not be removed: {source}")]
    PathConflict {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("address {path} is already in use by a live listener")]
    AddressInUse { path: PathBuf },

    #[error("socket operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-service failures recorded by the supervisor.
///
/// None of these abort the supervisor itself; they end up in the registry.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{service}: {source}")]
    Endpoint {
        service: ServiceId,
        #[source]
        source: EndpointError,
    },

    #[error("{service}: failed to spawn {command}: {source}")]
    Spawn {
        service: ServiceId,
        command: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: not bound within {timeout:?}")]
    BindTimeout { service: ServiceId, timeout: Duration },

    #[error("{service}: exited before binding ({status})")]
    ExitedBeforeBind {
        service: ServiceId,
        status: std::process::ExitStatus,
    },

    #[error("{service}: socket activation failed: {reason}")]
    Activation { service: ServiceId, reason: String },
}

/// Malformed or unexpected traffic on the liveness protocol
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown verb {0:?}")]
    UnknownVerb(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("unexpected trailing data {0:?}")]
    TrailingData(String),

    #[error("unknown service {0:?}")]
    UnknownService(String),

    #[error("framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),
}
