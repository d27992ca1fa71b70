use clap::Parser;
use std::process::ExitCode;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use sockinit::cli::{InitCli, InitConfig};
use sockinit::signals::{signal_name, Signals};
use sockinit::supervisor::Supervisor;
use sockinit::watcher::{EndpointEvent, EndpointWatchConfig, EndpointWatcher};
use sockinit::Result;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    sockinit::init_tracing()?;

    info!("init starting");

    let config = InitConfig::from_cli(InitCli::parse())?;

    // Handlers go in before any child exists, so an early SIGTERM still
    // leads through shutdown_all
    let mut signals = Signals::new()?;
    let mut supervisor = Supervisor::new(config.supervisor.clone());

    let mut watcher = if config.watch_endpoints {
        std::fs::create_dir_all(&config.socket_dir)?;
        let mut watcher = EndpointWatcher::new(EndpointWatchConfig {
            socket_dir: config.socket_dir.clone(),
            endpoints: config
                .supervisor
                .specs
                .iter()
                .map(|spec| (spec.id, spec.socket_path.clone()))
                .collect(),
        });
        watcher.start_watching().await?;
        Some(watcher)
    } else {
        debug!("Endpoint watching disabled");
        None
    };

    let ready = supervisor.start_all().await;
    for status in supervisor.snapshot() {
        info!(
            "{}: {} pid={:?} uptime={:?} ({})",
            status.id,
            status.state,
            status.pid,
            status.uptime,
            status.last_error.as_deref().unwrap_or("ok")
        );
    }
    if ready < config.supervisor.specs.len() {
        warn!("Running with {} of {} services", ready, config.supervisor.specs.len());
    }

    run_main_loop(&config, &mut supervisor, &mut signals, &mut watcher).await;

    let healthy = supervisor.all_ready();
    supervisor.shutdown_all().await;

    info!("init exiting");
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Supervises until a shutdown signal arrives
async fn run_main_loop(
    config: &InitConfig,
    supervisor: &mut Supervisor,
    signals: &mut Signals,
    watcher: &mut Option<EndpointWatcher>,
) {
    let mut health_interval = interval(config.health_interval);
    health_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            signal = signals.next() => {
                match signal {
                    Some(kind) => info!("received {}, shutting down", signal_name(kind)),
                    None => warn!("signal stream closed, shutting down"),
                }
                return;
            }

            _ = health_interval.tick() => {
                let restarted = supervisor.health_check().await;
                if !restarted.is_empty() {
                    info!("Restarted {:?}", restarted);
                }
            }

            id = supervisor.next_demand() => {
                supervisor.activate(id).await;
            }

            Some(event) = next_endpoint_event(watcher) => {
                match event {
                    EndpointEvent::Removed(id) => {
                        if supervisor.endpoint_lost(id).await {
                            info!("{} will be restarted on the next health check", id);
                        }
                    }
                    EndpointEvent::WatchError(error) => {
                        warn!("Endpoint watching error: {}", error);
                    }
                }
            }
        }
    }
}

/// Next watcher event, or never when watching is disabled
async fn next_endpoint_event(watcher: &mut Option<EndpointWatcher>) -> Option<EndpointEvent> {
    match watcher {
        Some(watcher) => watcher.next_event().await,
        None => std::future::pending().await,
    }
}
