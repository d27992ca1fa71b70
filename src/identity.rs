use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ProtocolError;

/// Identity of one of the three backing services.
///
/// The ordering is significant: the supervisor starts services in `A, B, C`
/// order and reports are always listed the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum ServiceId {
    A,
    B,
    C,
}

impl ServiceId {
    /// All identities in start order.
    pub const ALL: [ServiceId; 3] = [ServiceId::A, ServiceId::B, ServiceId::C];

    /// Wire representation used in acknowledgements.
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::A => "A",
            ServiceId::B => "B",
            ServiceId::C => "C",
        }
    }

    /// File name of the endpoint inside the socket directory.
    pub fn socket_name(self) -> &'static str {
        match self {
            ServiceId::A => "service_a_socket",
            ServiceId::B => "service_b_socket",
            ServiceId::C => "service_c_socket",
        }
    }

    /// Name of the binary implementing this service.
    pub fn binary_name(self) -> &'static str {
        match self {
            ServiceId::A => "service-a",
            ServiceId::B => "service-b",
            ServiceId::C => "service-c",
        }
    }

    pub fn socket_path(self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(self.socket_name())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service{}", self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(ServiceId::A),
            "B" | "b" => Ok(ServiceId::B),
            "C" | "c" => Ok(ServiceId::C),
            other => Err(ProtocolError::UnknownService(other.to_string())),
        }
    }
}
