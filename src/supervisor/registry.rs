use crate::activation::ActivatedSocket;
use crate::endpoint::Endpoint;
use crate::identity::ServiceId;
use crate::service::ServiceState;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::watch;

use super::restart::RestartTracker;
use super::ServiceSpec;

/// Everything the supervisor knows about one managed service
pub(super) struct ServiceEntry {
    pub spec: ServiceSpec,
    pub endpoint: Endpoint,
    pub child: Option<Child>,
    pub pid: Option<Pid>,
    /// Listener held on the service's behalf in activation mode
    pub activated: Option<ActivatedSocket>,
    /// The path was cleared or bound by us, so shutdown may remove it
    pub owns_path: bool,
    pub restarts: RestartTracker,
    pub started_at: Option<Instant>,
    pub exit_status: Option<ExitStatus>,
    pub last_error: Option<String>,
    /// Set once the restart budget ran out, so it is only reported once
    pub gave_up: bool,
    state_tx: watch::Sender<ServiceState>,
}

impl ServiceEntry {
    pub fn new(spec: ServiceSpec) -> Self {
        let endpoint = Endpoint::new(spec.id, &spec.socket_path);
        let (state_tx, _) = watch::channel(ServiceState::Starting);
        Self {
            spec,
            endpoint,
            child: None,
            pid: None,
            activated: None,
            owns_path: false,
            restarts: RestartTracker::new(),
            started_at: None,
            exit_status: None,
            last_error: None,
            gave_up: false,
            state_tx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: ServiceState) {
        self.state_tx.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            id: self.spec.id,
            socket_path: self.spec.socket_path.clone(),
            state: self.state(),
            pid: self.pid.map(|pid| pid.as_raw()),
            restarts: self.restarts.total(),
            uptime: self
                .started_at
                .filter(|_| self.state().is_ready())
                .map(|started| started.elapsed()),
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only copy of a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub socket_path: PathBuf,
    pub state: ServiceState,
    pub pid: Option<i32>,
    pub restarts: usize,
    pub uptime: Option<std::time::Duration>,
    pub last_error: Option<String>,
}

/// Map from identity to entry, iterated in start order
#[derive(Default)]
pub(super) struct Registry {
    entries: BTreeMap<ServiceId, ServiceEntry>,
}

impl Registry {
    pub fn get(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut ServiceEntry> {
        self.entries.get_mut(&id)
    }

    /// Returns the entry for `spec`, creating it on first use
    pub fn entry(&mut self, spec: &ServiceSpec) -> &mut ServiceEntry {
        self.entries
            .entry(spec.id)
            .or_insert_with(|| ServiceEntry::new(spec.clone()))
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceEntry> {
        self.entries.values_mut()
    }
}
