//! Line-delimited liveness protocol.
//!
//! ```text
//! client: PING <nonce>\n
//! server: PONG <service-id> <nonce>\n
//! server: ERR <reason>\n        (unrecognised request, session stays open)
//! ```
//!
//! Every message is one UTF-8 line, so a reader never has to guess where a
//! message ends.

use crate::error::ProtocolError;
use crate::identity::ServiceId;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

/// Longest accepted line, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 1024;

/// Wraps a stream in the protocol's line codec
pub fn framed<T>(io: T) -> Framed<T, LinesCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping { nonce: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong { service: ServiceId, nonce: String },
    Error { reason: String },
}

impl Request {
    pub fn ping(nonce: impl Into<String>) -> Self {
        Request::Ping {
            nonce: nonce.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => Err(ProtocolError::Empty),
            Some("PING") => {
                let nonce = parts.next().ok_or(ProtocolError::MissingField("nonce"))?;
                reject_trailing(parts)?;
                Ok(Request::ping(nonce))
            }
            Some(verb) => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            None => Err(ProtocolError::Empty),
            Some("PONG") => {
                let service = parts
                    .next()
                    .ok_or(ProtocolError::MissingField("service"))?
                    .parse()?;
                let nonce = parts.next().ok_or(ProtocolError::MissingField("nonce"))?;
                reject_trailing(parts)?;
                Ok(Response::Pong {
                    service,
                    nonce: nonce.to_string(),
                })
            }
            Some("ERR") => Ok(Response::Error {
                reason: parts.collect::<Vec<_>>().join(" "),
            }),
            Some(verb) => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }
}

fn reject_trailing<'a>(mut rest: impl Iterator<Item = &'a str>) -> Result<(), ProtocolError> {
    match rest.next() {
        Some(extra) => Err(ProtocolError::TrailingData(extra.to_string())),
        None => Ok(()),
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Ping { nonce } => write!(f, "PING {nonce}"),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Pong { service, nonce } => write!(f, "PONG {} {nonce}", service.as_str()),
            Response::Error { reason } => write!(f, "ERR {reason}"),
        }
    }
}
