use super::Result;
use crate::activation;
use crate::endpoint::Endpoint;
use crate::identity::ServiceId;
use crate::protocol::{self, Request, Response};
use crate::signals::{signal_name, Signals};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so descriptor exhaustion cannot spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle of a service process.
///
/// `Starting -> Bound -> Serving -> Terminated`, or `Starting -> Failed`
/// when the endpoint cannot be bound. Termination always comes from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Bound,
    Serving,
    Failed,
    Terminated,
}

impl ServiceState {
    /// Whether the endpoint is bound and accepting connections
    pub fn is_ready(self) -> bool {
        matches!(self, ServiceState::Bound | ServiceState::Serving)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Starting => "starting",
            ServiceState::Bound => "bound",
            ServiceState::Serving => "serving",
            ServiceState::Failed => "failed",
            ServiceState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Configuration of a single backing service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub id: ServiceId,
    pub socket_path: PathBuf,
    /// Delay before binding, modelling slow initialisation
    pub startup_delay: Duration,
    /// Sessions that stay silent this long are closed
    pub idle_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(id: ServiceId, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            socket_path: socket_path.into(),
            startup_delay: Duration::ZERO,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// A service whose endpoint is bound and ready to serve
pub struct Service {
    id: ServiceId,
    listener: UnixListener,
    /// Set when this process bound the path itself and must unlink it
    endpoint: Option<Endpoint>,
    idle_timeout: Duration,
}

impl Service {
    /// Runs the `starting -> bound` transition.
    ///
    /// Adopts a listener inherited from the supervisor when one was passed,
    /// otherwise clears any stale file and binds the configured path.
    pub async fn bind(config: &ServiceConfig) -> Result<Self> {
        info!("{} {}", config.id, ServiceState::Starting);

        if !config.startup_delay.is_zero() {
            debug!("{} delaying startup by {:?}", config.id, config.startup_delay);
            sleep(config.startup_delay).await;
        }

        let (listener, endpoint) = match activation::listener_from_env(config.id)? {
            Some(inherited) => {
                info!("{} using socket handed over by init", config.id);
                (inherited, None)
            }
            None => {
                let mut endpoint = Endpoint::new(config.id, &config.socket_path);
                endpoint.create()?;
                let listener = endpoint.bind()?;
                (listener, Some(endpoint))
            }
        };

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        info!(
            "{} {} at {}",
            config.id,
            ServiceState::Bound,
            config.socket_path.display()
        );

        Ok(Self {
            id: config.id,
            listener,
            endpoint,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Accepts sessions until `shutdown` resolves.
    ///
    /// Each session runs on its own task so a slow client cannot hold up the
    /// acceptor. On shutdown the socket file is removed if this process
    /// created it; an inherited socket belongs to the supervisor.
    pub async fn serve<F>(mut self, shutdown: F) -> Result<ServiceState>
    where
        F: Future<Output = ()>,
    {
        info!("{} {}", self.id, ServiceState::Serving);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("{} received shutdown", self.id);
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _address)) => {
                            let id = self.id;
                            let idle_timeout = self.idle_timeout;
                            tokio::spawn(async move {
                                handle_session(id, stream, idle_timeout).await;
                            });
                        }
                        Err(e) => {
                            warn!("{} accept failed: {}", self.id, e);
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.unlink()?;
        }

        info!("{} {}", self.id, ServiceState::Terminated);
        Ok(ServiceState::Terminated)
    }
}

/// Exit code of a service that could not bind its endpoint
pub const EXIT_BIND_FAILED: u8 = 2;

/// Entry point shared by the service binaries.
///
/// A bind failure is fatal and reported through the exit code so the
/// supervisor sees it; SIGINT or SIGTERM end the accept loop.
pub async fn run(config: ServiceConfig) -> ExitCode {
    let service = match Service::bind(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("{} {}: {:#}", config.id, ServiceState::Failed, e);
            return ExitCode::from(EXIT_BIND_FAILED);
        }
    };

    let mut signals = match Signals::new() {
        Ok(signals) => signals,
        Err(e) => {
            error!("{} cannot install signal handlers: {}", config.id, e);
            return ExitCode::FAILURE;
        }
    };

    let id = config.id;
    let shutdown = async move {
        if let Some(kind) = signals.next().await {
            info!("{} received {}", id, signal_name(kind));
        }
    };

    match service.serve(shutdown).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{} stopped with error: {}", id, e);
            ExitCode::FAILURE
        }
    }
}

/// Answers liveness queries on one connection until the client goes away
async fn handle_session(id: ServiceId, stream: UnixStream, idle_timeout: Duration) {
    let mut framed = protocol::framed(stream);

    loop {
        let line = match timeout(idle_timeout, framed.next()).await {
            Err(_) => {
                debug!("{} closing idle session", id);
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                warn!("{} dropping session: {}", id, e);
                return;
            }
            Ok(Some(Ok(line))) => line,
        };

        debug!("{} got message {:?}", id, line);

        let response = match Request::parse(&line) {
            Ok(Request::Ping { nonce }) => Response::Pong { service: id, nonce },
            Err(e) => Response::Error {
                reason: e.to_string(),
            },
        };

        match timeout(idle_timeout, framed.send(response.to_string())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("{} could not answer: {}", id, e);
                return;
            }
            Err(_) => {
                debug!("{} write timed out", id);
                return;
            }
        }
    }
}
