use crate::error::EndpointError;
use crate::identity::ServiceId;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Listen backlog for endpoint sockets
const LISTEN_BACKLOG: i32 = 128;

/// Bind state of an endpoint as seen by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Bound,
    Closed,
}

/// A Unix domain socket bind point addressed by a filesystem path.
///
/// The socket file is the only persistent resource in the system, so every
/// operation here is safe to repeat: removing an absent path is not an error
/// and a stale file left behind by a killed process is cleared before binding.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: ServiceId,
    path: PathBuf,
    state: BindState,
}

impl Endpoint {
    pub fn new(id: ServiceId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            state: BindState::Unbound,
        }
    }

    /// Endpoint for `id` inside `socket_dir`, using the well-known file name
    pub fn in_dir(id: ServiceId, socket_dir: &Path) -> Self {
        Self::new(id, id.socket_path(socket_dir))
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    /// Prepares the path for binding.
    ///
    /// Removes whatever is left at the path (ignoring not-found) and makes
    /// sure the parent directory exists. A socket that still has a live
    /// listener behind it is left alone and reported as `AddressInUse`.
    pub fn create(&mut self) -> Result<(), EndpointError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EndpointError::Io {
                path: self.path.clone(),
                source,
            })?;
        }

        if self.is_socket_on_disk() && is_live(&self.path) {
            return Err(EndpointError::AddressInUse {
                path: self.path.clone(),
            });
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed stale file at {}", self.path.display());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EndpointError::PathConflict {
                    path: self.path.clone(),
                    source,
                });
            }
        }

        self.state = BindState::Unbound;
        Ok(())
    }

    /// Binds and listens on the endpoint path.
    ///
    /// If the path is occupied by a stale socket (nothing accepts on it) the
    /// file is unlinked and the bind retried once. A live listener is never
    /// displaced.
    pub fn bind(&mut self) -> Result<UnixListener, EndpointError> {
        let listener = match self.bind_socket() {
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if is_live(&self.path) {
                    return Err(EndpointError::AddressInUse {
                        path: self.path.clone(),
                    });
                }
                warn!("Stale socket at {}, rebinding", self.path.display());
                self.create()?;
                self.bind_socket().map_err(|e| self.classify_bind_error(e))?
            }
            other => other.map_err(|e| self.classify_bind_error(e))?,
        };

        self.state = BindState::Bound;
        debug!("{} bound at {}", self.id, self.path.display());
        Ok(listener)
    }

    /// Removes the socket file. Absence of the file is not an error.
    pub fn unlink(&mut self) -> Result<(), EndpointError> {
        self.state = BindState::Closed;
        unlink_path(&self.path)
    }

    /// Whether a socket file currently exists at the endpoint path
    pub fn is_socket_on_disk(&self) -> bool {
        std::fs::symlink_metadata(&self.path)
            .map(|meta| meta.file_type().is_socket())
            .unwrap_or(false)
    }

    fn bind_socket(&self) -> std::io::Result<UnixListener> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(&self.path)?)?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    }

    fn classify_bind_error(&self, source: std::io::Error) -> EndpointError {
        match source.kind() {
            ErrorKind::AddrInUse => EndpointError::AddressInUse {
                path: self.path.clone(),
            },
            _ => EndpointError::Io {
                path: self.path.clone(),
                source,
            },
        }
    }
}

/// Removes a socket path, treating a missing file as success
pub fn unlink_path(path: &Path) -> Result<(), EndpointError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Unlinked {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(EndpointError::PathConflict {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Checks whether something is accepting connections on `path`.
///
/// Uses a non-blocking connect so a listener with a full backlog cannot
/// stall the caller; only a refused connect proves the socket is stale.
pub fn is_live(path: &Path) -> bool {
    let Ok(socket) = Socket::new(Domain::UNIX, Type::STREAM, None) else {
        return false;
    };
    if socket.set_nonblocking(true).is_err() {
        return false;
    }
    let Ok(addr) = SockAddr::unix(path) else {
        return false;
    };

    match socket.connect(&addr) {
        Ok(()) => true,
        Err(e) => {
            e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(nix::libc::EINPROGRESS)
        }
    }
}
