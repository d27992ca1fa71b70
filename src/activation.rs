use super::Result;
use crate::endpoint::Endpoint;
use crate::environment::Environment;
use crate::error::EndpointError;
use crate::identity::ServiceId;
use eyre::eyre;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info};

/// Environment variable carrying the inherited listener descriptor
pub const LISTEN_FD_ENV: &str = "SOCKINIT_LISTEN_FD";

/// Environment variable carrying the identity the listener was bound for
pub const SERVICE_ID_ENV: &str = "SOCKINIT_SERVICE_ID";

/// A listening socket bound by the supervisor on behalf of a service.
///
/// The supervisor keeps the listener open for as long as the service is
/// managed, so the endpoint stays connectable across service restarts:
/// clients queue in the backlog until the next instance accepts.
pub struct ActivatedSocket {
    /// Reactor registration used to wait for a first client; dropped
    /// before the listener it refers to
    incoming: Option<AsyncFd<RawFd>>,
    endpoint: Endpoint,
    listener: UnixListener,
}

impl ActivatedSocket {
    /// Clears stale state at the endpoint path and binds it
    pub fn bind(mut endpoint: Endpoint) -> std::result::Result<Self, EndpointError> {
        endpoint.create()?;
        let listener = endpoint.bind()?;
        info!(
            "Bound {} for socket activation of {}",
            endpoint.path().display(),
            endpoint.id()
        );
        Ok(Self {
            incoming: None,
            endpoint,
            listener,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Variables telling the service which descriptor to adopt
    pub fn activation_env(&self) -> Environment {
        let mut env = Environment::new();
        env.set(LISTEN_FD_ENV, self.raw_fd().to_string());
        env.set(SERVICE_ID_ENV, self.endpoint.id().as_str());
        env
    }

    /// Registers the listener with the reactor so [`Self::incoming`] can
    /// wait for clients. Needs a running tokio runtime.
    pub fn watch_incoming(&mut self) -> io::Result<()> {
        if self.incoming.is_none() {
            self.listener.set_nonblocking(true)?;
            self.incoming = Some(AsyncFd::with_interest(self.raw_fd(), Interest::READABLE)?);
        }
        Ok(())
    }

    /// Resolves once a client is waiting in the backlog.
    ///
    /// Nothing is accepted here; the connection stays queued for the
    /// service that is spawned to handle it. Never resolves when the socket
    /// is not being watched.
    pub async fn incoming(&self) -> io::Result<()> {
        let Some(incoming) = &self.incoming else {
            return std::future::pending().await;
        };

        loop {
            let mut guard = incoming.readable().await?;
            if self.has_pending_connection()? {
                return Ok(());
            }
            // Readiness left over from clients an earlier instance accepted
            guard.clear_ready();
        }
    }

    fn has_pending_connection(&self) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::ZERO).map_err(io::Error::from)?;
        Ok(ready > 0
            && fds[0]
                .revents()
                .is_some_and(|events| events.contains(PollFlags::POLLIN)))
    }

    /// Closes the listener and removes the socket file
    pub fn close(mut self) -> std::result::Result<(), EndpointError> {
        drop(self.incoming.take());
        drop(self.listener);
        self.endpoint.unlink()
    }
}

/// Makes `fd` survive `exec` in the child.
///
/// Meant to run between fork and exec (from `pre_exec`), so only the child
/// being spawned inherits the listener, not every sibling service.
pub fn clear_cloexec(fd: RawFd) -> nix::Result<()> {
    let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut flags = FdFlag::from_bits_truncate(fcntl(borrowed_fd, FcntlArg::F_GETFD)?);
    flags.remove(FdFlag::FD_CLOEXEC);
    fcntl(borrowed_fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Adopts the listener handed over by the supervisor, if any.
///
/// Returns `Ok(None)` when the process was not socket-activated. The
/// descriptor is marked close-on-exec again so it does not leak further.
pub fn listener_from_env(expected: ServiceId) -> Result<Option<UnixListener>> {
    let Ok(value) = std::env::var(LISTEN_FD_ENV) else {
        return Ok(None);
    };

    if let Ok(bound_for) = std::env::var(SERVICE_ID_ENV) {
        let bound_for: ServiceId = bound_for.parse()?;
        if bound_for != expected {
            return Err(eyre!(
                "inherited listener belongs to {}, not {}",
                bound_for,
                expected
            ));
        }
    }

    let fd: RawFd = value
        .trim()
        .parse()
        .map_err(|e| eyre!("invalid {} value {:?}: {}", LISTEN_FD_ENV, value, e))?;

    let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut flags = FdFlag::from_bits_truncate(fcntl(borrowed_fd, FcntlArg::F_GETFD)?);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(borrowed_fd, FcntlArg::F_SETFD(flags))?;

    debug!("Adopting inherited listener on fd {}", fd);
    Ok(Some(unsafe { UnixListener::from_raw_fd(fd) }))
}
