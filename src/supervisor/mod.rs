//! Service supervision: start, monitor, restart and tear down the backing
//! services, one registry entry per service identity.

mod registry;
mod restart;

pub use crate::service::ServiceState;
pub use registry::ServiceStatus;
pub use restart::{RestartPolicy, RestartTracker};

use crate::activation::{self, ActivatedSocket, LISTEN_FD_ENV, SERVICE_ID_ENV};
use crate::environment::Environment;
use crate::error::SupervisorError;
use crate::identity::ServiceId;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use registry::{Registry, ServiceEntry};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// How a service is launched
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: ServiceId,
    /// Program to execute
    pub command: PathBuf,
    /// Arguments for the program
    pub args: Vec<String>,
    /// Endpoint the service is expected to bind
    pub socket_path: PathBuf,
    /// Extra environment for this service only
    pub environment: Environment,
}

impl ServiceSpec {
    /// Spec for the stock service binary found in `bin_dir`
    pub fn for_binary(
        id: ServiceId,
        bin_dir: &Path,
        socket_dir: &Path,
        startup_delay: Duration,
    ) -> Self {
        let socket_path = id.socket_path(socket_dir);
        Self {
            id,
            command: bin_dir.join(id.binary_name()),
            args: vec![
                "--socket".to_string(),
                socket_path.display().to_string(),
                "--startup-delay-ms".to_string(),
                startup_delay.as_millis().to_string(),
            ],
            socket_path,
            environment: Environment::new(),
        }
    }
}

/// Configuration for supervision behavior
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Services in start order
    pub specs: Vec<ServiceSpec>,
    /// Bind endpoints in the supervisor and pass the listener down
    pub activation: bool,
    /// Spawn a service only once a client connects to its endpoint.
    /// Implies `activation`.
    pub on_demand: bool,
    /// Time a service gets to reach `bound`
    pub bind_timeout: Duration,
    /// Time between SIGTERM and SIGKILL during shutdown
    pub graceful_shutdown_timeout: Duration,
    /// How often the readiness gate polls for the socket file
    pub bind_poll_interval: Duration,
    pub restart_policy: RestartPolicy,
    /// Environment added for every service
    pub environment: Environment,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            activation: false,
            on_demand: false,
            bind_timeout: Duration::from_secs(2),
            graceful_shutdown_timeout: Duration::from_secs(1),
            bind_poll_interval: Duration::from_millis(20),
            restart_policy: RestartPolicy::default(),
            environment: Environment::new(),
        }
    }
}

/// Owns the full set of service processes.
///
/// The registry is private; other components observe it through
/// [`Supervisor::snapshot`] and the per-service readiness gates.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Registry,
    stopped: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            registry: Registry::default(),
            stopped: false,
        }
    }

    /// Starts every configured service in order.
    ///
    /// A service that fails is recorded as `failed` and the remaining ones
    /// are still started. Returns the number of services that reached
    /// `bound`.
    pub async fn start_all(&mut self) -> usize {
        let specs = self.config.specs.clone();
        let mut ready = 0;

        for spec in &specs {
            match self.start_service(spec).await {
                Ok(()) => ready += 1,
                Err(e) => error!("{}", e),
            }
        }

        info!("{} of {} services ready", ready, specs.len());
        ready
    }

    /// Starts (or restarts) a single service and waits for it to bind
    async fn start_service(&mut self, spec: &ServiceSpec) -> Result<(), SupervisorError> {
        let config = &self.config;
        let entry = self.registry.entry(spec);

        entry.set_state(ServiceState::Starting);
        entry.exit_status = None;
        info!("Starting {}: {} {:?}", spec.id, spec.command.display(), spec.args);

        let result = launch(entry, config).await;
        match &result {
            Ok(()) => {
                entry.last_error = None;
                entry.gave_up = false;
                entry.set_state(ServiceState::Bound);
                if entry.child.is_some() {
                    info!("{} bound at {}", spec.id, spec.socket_path.display());
                } else {
                    info!(
                        "{} listening at {}, waiting for a client",
                        spec.id,
                        spec.socket_path.display()
                    );
                }
            }
            Err(e) => {
                entry.last_error = Some(e.to_string());
                entry.set_state(ServiceState::Failed);
                if entry.child.is_some() {
                    kill_entry(entry).await;
                }
            }
        }
        result
    }

    /// Detects services that died and respawns them within the restart
    /// budget.
    ///
    /// Returns the services that were restarted successfully.
    pub async fn health_check(&mut self) -> Vec<ServiceId> {
        if self.stopped {
            return Vec::new();
        }

        for entry in self.registry.iter_mut() {
            let Some(child) = entry.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!("{} exited unexpectedly: {}", entry.spec.id, status);
                    entry.child = None;
                    entry.pid = None;
                    entry.started_at = None;
                    entry.exit_status = Some(status);
                    entry.last_error = Some(format!("exited: {status}"));
                    entry.set_state(ServiceState::Failed);
                }
                Ok(None) => {}
                Err(e) => warn!("{} could not be polled: {}", entry.spec.id, e),
            }
        }

        let mut restarted = Vec::new();
        let now = Instant::now();
        let policy = self.config.restart_policy;

        for id in self.registry.ids() {
            let Some(entry) = self.registry.get_mut(id) else {
                continue;
            };
            if entry.state() != ServiceState::Failed {
                continue;
            }
            if !entry.restarts.try_acquire(&policy, now) {
                if !entry.gave_up {
                    error!(
                        "{} exceeded {} restarts in {:?}, leaving it failed",
                        id, policy.max_restarts, policy.window
                    );
                    entry.gave_up = true;
                }
                continue;
            }

            let spec = entry.spec.clone();
            info!(
                "Restarting {} (restart #{}, {} within {:?})",
                id,
                entry.restarts.total(),
                entry.restarts.recent(),
                policy.window
            );
            match self.start_service(&spec).await {
                Ok(()) => restarted.push(id),
                Err(e) => error!("Restart failed: {}", e),
            }
        }

        restarted
    }

    /// Handles the socket file of a running service disappearing.
    ///
    /// Clients can no longer reach the service, so it is stopped and marked
    /// failed; the next health check rebinds it. Returns false when the
    /// endpoint is in fact still present (e.g. the removal was our own stale
    /// cleanup before a restart).
    pub async fn endpoint_lost(&mut self, id: ServiceId) -> bool {
        if self.stopped {
            return false;
        }
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        if !entry.state().is_ready() || entry.endpoint.is_socket_on_disk() {
            return false;
        }

        warn!("{} socket {} was removed", id, entry.spec.socket_path.display());
        kill_entry(entry).await;
        // The held listener is bound to an inode that no longer has a name
        entry.activated = None;
        entry.last_error = Some("socket file removed".to_string());
        entry.set_state(ServiceState::Failed);
        true
    }

    /// Terminates every service and removes every endpoint.
    ///
    /// SIGTERM goes to each service's process group first; whatever is still
    /// alive after the graceful timeout is killed. Safe to call when some
    /// services never started, and safe to call twice.
    pub async fn shutdown_all(&mut self) {
        self.stopped = true;
        info!("Shutting down {} services", self.registry.ids().len());

        for entry in self.registry.iter() {
            if let Some(pid) = entry.pid {
                if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to {}: {}", entry.spec.id, e);
                }
            }
        }

        let deadline = tokio::time::Instant::from_std(deadline_after(
            Instant::now(),
            self.config.graceful_shutdown_timeout,
        ));
        for entry in self.registry.iter_mut() {
            let Some(child) = entry.child.as_mut() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("{} exited with {}", entry.spec.id, status);
                    entry.exit_status = Some(status);
                    entry.child = None;
                    entry.pid = None;
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for {}: {}", entry.spec.id, e);
                    kill_entry(entry).await;
                }
                Err(_) => {
                    warn!("{} ignored SIGTERM, forcing kill", entry.spec.id);
                    kill_entry(entry).await;
                }
            }
        }

        for entry in self.registry.iter_mut() {
            let unlinked = match entry.activated.take() {
                Some(socket) => socket.close(),
                None if entry.owns_path => entry.endpoint.unlink(),
                None => {
                    debug!("{} never owned {}", entry.spec.id, entry.spec.socket_path.display());
                    Ok(())
                }
            };
            entry.owns_path = false;
            if let Err(e) = unlinked {
                warn!("Failed to remove endpoint of {}: {}", entry.spec.id, e);
            }
            if entry.state() != ServiceState::Failed {
                entry.set_state(ServiceState::Terminated);
            }
        }

        info!("All services stopped");
    }

    /// Read-only view of the registry, in start order
    pub fn snapshot(&self) -> Vec<ServiceStatus> {
        self.registry.iter().map(ServiceEntry::status).collect()
    }

    pub fn status(&self, id: ServiceId) -> Option<ServiceStatus> {
        self.registry.get(id).map(ServiceEntry::status)
    }

    /// Readiness gate for one service.
    ///
    /// The receiver observes every state transition the supervisor records.
    pub fn readiness(&self, id: ServiceId) -> Option<watch::Receiver<ServiceState>> {
        self.registry.get(id).map(ServiceEntry::subscribe)
    }

    /// Waits until `id` is bound, giving up after `wait`
    pub async fn wait_ready(&self, id: ServiceId, wait: Duration) -> bool {
        let Some(mut rx) = self.readiness(id) else {
            return false;
        };
        let ready = matches!(
            timeout(wait, rx.wait_for(|state| state.is_ready())).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Waits until a client connects to the endpoint of a service that is
    /// not running yet.
    ///
    /// Only meaningful with `on_demand`; otherwise, or when every service
    /// is running, it never resolves.
    pub async fn next_demand(&self) -> ServiceId {
        let waiting: Vec<_> = self
            .registry
            .iter()
            .filter(|entry| {
                self.config.on_demand
                    && !self.stopped
                    && entry.child.is_none()
                    && entry.state() == ServiceState::Bound
            })
            .filter_map(|entry| {
                let id = entry.spec.id;
                entry.activated.as_ref().map(|socket| {
                    Box::pin(async move {
                        if let Err(e) = socket.incoming().await {
                            warn!("Waiting for clients of {} failed: {}", id, e);
                        }
                        id
                    })
                })
            })
            .collect();

        if waiting.is_empty() {
            return std::future::pending().await;
        }
        let (id, _, _) = futures::future::select_all(waiting).await;
        id
    }

    /// Spawns a service whose endpoint has a client waiting.
    ///
    /// Returns false when the service is already running or could not be
    /// started; a failed start is recorded like any other and left to the
    /// health check.
    pub async fn activate(&mut self, id: ServiceId) -> bool {
        if self.stopped {
            return false;
        }
        let config = &self.config;
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        if entry.child.is_some() || entry.activated.is_none() {
            return false;
        }

        info!("Client waiting on {}, starting {}", entry.spec.socket_path.display(), id);
        match spawn_and_wait(entry, config).await {
            Ok(()) => {
                info!("{} started on demand", id);
                true
            }
            Err(e) => {
                error!("{}", e);
                entry.last_error = Some(e.to_string());
                entry.set_state(ServiceState::Failed);
                if entry.child.is_some() {
                    kill_entry(entry).await;
                }
                false
            }
        }
    }

    /// True when every configured service is currently bound
    pub fn all_ready(&self) -> bool {
        self.config.specs.iter().all(|spec| {
            self.registry
                .get(spec.id)
                .is_some_and(|entry| entry.state().is_ready())
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Emergency cleanup when dropped without shutdown_all
        for entry in self.registry.iter() {
            if entry.child.is_none() {
                continue;
            }
            if let Some(pid) = entry.pid {
                match signal_group(pid, Signal::SIGKILL) {
                    Ok(()) | Err(nix::Error::ESRCH) => {}
                    Err(e) => eprintln!(
                        "Failed to kill {} (PID {}) during emergency cleanup: {}",
                        entry.spec.id, pid, e
                    ),
                }
            }
        }
    }
}

/// Prepares the endpoint, then spawns the service and waits for `bound`.
///
/// In on-demand mode the spawn is deferred until a client shows up.
async fn launch(entry: &mut ServiceEntry, config: &SupervisorConfig) -> Result<(), SupervisorError> {
    prepare_endpoint(entry, config)?;
    if config.on_demand {
        return Ok(());
    }
    spawn_and_wait(entry, config).await
}

/// Clears the path, or binds it on the service's behalf in activation mode
fn prepare_endpoint(entry: &mut ServiceEntry, config: &SupervisorConfig) -> Result<(), SupervisorError> {
    let id = entry.spec.id;

    if config.activation || config.on_demand {
        if entry.activated.is_none() {
            entry.owns_path = false;
            let mut socket = ActivatedSocket::bind(entry.endpoint.clone())
                .map_err(|source| SupervisorError::Endpoint { service: id, source })?;
            entry.owns_path = true;
            if config.on_demand {
                socket.watch_incoming().map_err(|e| SupervisorError::Activation {
                    service: id,
                    reason: e.to_string(),
                })?;
            }
            entry.activated = Some(socket);
        }
    } else {
        entry.owns_path = false;
        entry
            .endpoint
            .create()
            .map_err(|source| SupervisorError::Endpoint { service: id, source })?;
        entry.owns_path = true;
    }
    Ok(())
}

async fn spawn_and_wait(entry: &mut ServiceEntry, config: &SupervisorConfig) -> Result<(), SupervisorError> {
    let id = entry.spec.id;
    let child = spawn_child(entry, config)?;
    let pid = child
        .id()
        .and_then(|raw| i32::try_from(raw).ok())
        .map(Pid::from_raw);
    entry.pid = pid;
    entry.child = Some(child);
    entry.started_at = Some(Instant::now());
    debug!("{} spawned with PID {:?}", id, pid);

    wait_for_bound(entry, config).await
}

fn spawn_child(entry: &ServiceEntry, config: &SupervisorConfig) -> Result<Child, SupervisorError> {
    let spec = &entry.spec;

    let mut env = Environment::inherited();
    env.remove(LISTEN_FD_ENV);
    env.remove(SERVICE_ID_ENV);
    env.extend(config.environment.clone());
    env.extend(spec.environment.clone());

    let inherited_fd = entry.activated.as_ref().map(|socket| {
        env.extend(socket.activation_env());
        socket.raw_fd()
    });

    let mut command = Command::new(&spec.command);
    command.args(&spec.args);

    // Own process group, so shutdown signals reach anything the service forks
    command.process_group(0);
    command.kill_on_drop(true);
    command.stdin(Stdio::null());
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    command.env_clear();
    for (key, value) in env.iter() {
        command.env(key, value);
    }

    unsafe {
        command.pre_exec(move || {
            use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

            // The child inherits our signal mask; give it a clean one
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            if let Some(fd) = inherited_fd {
                activation::clear_cloexec(fd)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }
            Ok(())
        });
    }

    command.spawn().map_err(|source| SupervisorError::Spawn {
        service: spec.id,
        command: spec.command.clone(),
        source,
    })
}

/// Readiness gate: resolves once the service's endpoint is bound.
///
/// In activation mode the supervisor already holds the bound listener. In
/// bind mode the path was cleared before spawning, so a socket file showing
/// up there can only come from the service's own bind.
async fn wait_for_bound(entry: &mut ServiceEntry, config: &SupervisorConfig) -> Result<(), SupervisorError> {
    let id = entry.spec.id;
    let deadline = deadline_after(Instant::now(), config.bind_timeout);

    loop {
        if let Some(child) = entry.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                entry.exit_status = Some(status);
                entry.child = None;
                entry.pid = None;
                return Err(SupervisorError::ExitedBeforeBind { service: id, status });
            }
        }

        let bound = match &entry.activated {
            Some(socket) => socket.endpoint().is_socket_on_disk(),
            None => entry.endpoint.is_socket_on_disk(),
        };
        if bound {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(SupervisorError::BindTimeout {
                service: id,
                timeout: config.bind_timeout,
            });
        }
        sleep(config.bind_poll_interval).await;
    }
}

/// SIGKILLs the service's process group and reaps it
async fn kill_entry(entry: &mut ServiceEntry) {
    if let Some(pid) = entry.pid.take() {
        match signal_group(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => warn!("Failed to SIGKILL {}: {}", entry.spec.id, e),
        }
    }

    if let Some(mut child) = entry.child.take() {
        if let Err(e) = child.start_kill() {
            debug!("{} already gone: {}", entry.spec.id, e);
        }
        match timeout(Duration::from_secs(1), child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} killed, exit status: {}", entry.spec.id, status);
                entry.exit_status = Some(status);
            }
            Ok(Err(e)) => warn!("Error reaping {}: {}", entry.spec.id, e),
            Err(_) => warn!("{} did not die after SIGKILL", entry.spec.id),
        }
    }
}

/// `start + wait`, saturating instead of overflowing on absurd waits
fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + Duration::from_secs(u32::MAX as u64))
}

fn signal_group(pid: Pid, signal: Signal) -> nix::Result<()> {
    debug!("Sending {:?} to process group {}", signal, pid);
    killpg(pid, signal)
}
