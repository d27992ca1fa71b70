use super::Result;
use crate::identity::ServiceId;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Events emitted by the endpoint watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The socket file of a service disappeared
    Removed(ServiceId),
    /// The underlying watcher reported an error
    WatchError(String),
}

/// Configuration for endpoint watching
#[derive(Debug, Clone)]
pub struct EndpointWatchConfig {
    /// Directory containing the socket files
    pub socket_dir: PathBuf,
    /// Socket paths to track, by service
    pub endpoints: Vec<(ServiceId, PathBuf)>,
}

/// Watches the socket directory for endpoints being deleted underneath
/// their services.
///
/// A deleted socket file leaves the service running but unreachable, so the
/// supervisor treats it like a crash. Every removal is reported; the
/// supervisor ignores the ones caused by its own cleanup, since the socket is
/// back on disk or the service is not ready by the time it looks.
pub struct EndpointWatcher {
    watcher: Option<RecommendedWatcher>,
    config: EndpointWatchConfig,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
    event_rx: mpsc::UnboundedReceiver<EndpointEvent>,
}

impl EndpointWatcher {
    pub fn new(config: EndpointWatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        EndpointWatcher {
            watcher: None,
            config,
            event_tx,
            event_rx,
        }
    }

    /// Starts watching the socket directory.
    ///
    /// Raw notify events are forwarded to a task that maps paths back to
    /// service identities.
    pub async fn start_watching(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Err(e) = tx.blocking_send(res) {
                    error!("Failed to forward endpoint event: {}", e);
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(&self.config.socket_dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for removed endpoints", self.config.socket_dir.display());
        self.watcher = Some(watcher);

        let tracked: HashMap<PathBuf, ServiceId> = self
            .config
            .endpoints
            .iter()
            .map(|(id, path)| (normalize(path), *id))
            .collect();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => {
                        debug!("Endpoint directory event: {:?}", event);
                        if !event.kind.is_remove() {
                            continue;
                        }

                        for path in &event.paths {
                            let Some(&id) = tracked.get(&normalize(path)) else {
                                continue;
                            };

                            if event_tx.send(EndpointEvent::Removed(id)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Endpoint watching error: {}", e);
                        if event_tx.send(EndpointEvent::WatchError(e.to_string())).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Waits for the next event
    pub async fn next_event(&mut self) -> Option<EndpointEvent> {
        self.event_rx.recv().await
    }

    /// Waits for the next event, giving up after `timeout_duration`
    pub async fn wait_for_event(&mut self, timeout_duration: Duration) -> Option<EndpointEvent> {
        timeout(timeout_duration, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for EndpointWatcher {
    fn drop(&mut self) {
        self.watcher.take();
    }
}

/// Resolves the directory part so relative and absolute spellings of the
/// same socket compare equal
fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}
