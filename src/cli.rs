use clap::Parser;
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::ServiceId;
use crate::probe::{Backoff, ProbeConfig};
use crate::service::ServiceConfig;
use crate::supervisor::{RestartPolicy, ServiceSpec, SupervisorConfig};

type Result<T> = color_eyre::eyre::Result<T>;

/// Upper bound for any duration given on the command line (one day)
pub const MAX_MILLIS: u64 = 24 * 60 * 60 * 1000;

fn millis() -> clap::builder::RangedU64ValueParser<u64> {
    clap::value_parser!(u64).range(..=MAX_MILLIS)
}

/// Supervisor owning the socket-activated backing services
#[derive(Parser, Debug)]
#[command(name = "init")]
#[command(about = "Supervise services exposed on Unix domain sockets")]
#[command(version)]
pub struct InitCli {
    /// Directory holding the service sockets
    #[arg(long, default_value = ".")]
    pub socket_dir: PathBuf,

    /// Directory containing the service binaries (default: next to init)
    #[arg(long)]
    pub service_bin_dir: Option<PathBuf>,

    /// Services to manage, comma-separated
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = ServiceId::ALL.to_vec())]
    pub services: Vec<ServiceId>,

    /// Bind sockets in init and hand them to the services
    #[arg(long)]
    pub activation: bool,

    /// Start each service only when its first client connects (implies --activation)
    #[arg(long)]
    pub on_demand: bool,

    /// Time a service gets to bind its socket (ms)
    #[arg(long, default_value = "2000", value_parser = millis())]
    pub bind_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL on shutdown (ms)
    #[arg(long, default_value = "1000", value_parser = millis())]
    pub graceful_timeout_ms: u64,

    /// Health check interval (ms)
    #[arg(long, default_value = "500", value_parser = millis())]
    pub health_interval_ms: u64,

    /// Restarts allowed per service within the restart window
    #[arg(long, default_value = "3")]
    pub max_restarts: usize,

    /// Sliding restart window (ms)
    #[arg(long, default_value = "10000", value_parser = millis())]
    pub restart_window_ms: u64,

    /// Artificial delay before each service binds (ms)
    #[arg(long, default_value = "0", value_parser = millis())]
    pub startup_delay_ms: u64,

    /// Do not watch the socket directory for removed endpoints
    #[arg(long)]
    pub no_watch: bool,
}

/// Liveness probe for the service endpoints
#[derive(Parser, Debug)]
#[command(name = "ping")]
#[command(about = "Check that every service endpoint answers")]
#[command(version)]
pub struct PingCli {
    /// Directory holding the service sockets
    #[arg(long, default_value = ".")]
    pub socket_dir: PathBuf,

    /// Services to probe, comma-separated
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = ServiceId::ALL.to_vec())]
    pub services: Vec<ServiceId>,

    /// Timeout for a single connect attempt (ms)
    #[arg(long, default_value = "200", value_parser = millis())]
    pub connect_timeout_ms: u64,

    /// Timeout for the acknowledgement after a query (ms)
    #[arg(long, default_value = "500", value_parser = millis())]
    pub response_timeout_ms: u64,

    /// Maximum connection attempts per endpoint
    #[arg(long, default_value = "10")]
    pub max_attempts: u32,

    /// First retry delay (ms), doubled after every failed attempt
    #[arg(long, default_value = "50", value_parser = millis())]
    pub initial_backoff_ms: u64,

    /// Upper bound for the retry delay (ms)
    #[arg(long, default_value = "800", value_parser = millis())]
    pub max_backoff_ms: u64,

    /// Budget for a single endpoint (ms)
    #[arg(long, default_value = "3000", value_parser = millis())]
    pub endpoint_budget_ms: u64,

    /// Budget for the whole probe run (ms)
    #[arg(long, default_value = "5000", value_parser = millis())]
    pub budget_ms: u64,

    /// Keep probing until interrupted
    #[arg(long)]
    pub continuous: bool,

    /// Pause between rounds in continuous mode (ms)
    #[arg(long, default_value = "1000", value_parser = millis())]
    pub interval_ms: u64,
}

/// One backing service
#[derive(Parser, Debug)]
#[command(about = "Backing service answering liveness queries on a Unix socket")]
#[command(version)]
pub struct ServiceCli {
    /// Socket path (default: the well-known name inside --socket-dir)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Directory holding the service sockets
    #[arg(long, default_value = ".")]
    pub socket_dir: PathBuf,

    /// Delay before binding (ms)
    #[arg(long, default_value = "0", value_parser = millis())]
    pub startup_delay_ms: u64,

    /// Idle time after which a silent session is closed (ms)
    #[arg(long, default_value = "5000", value_parser = millis())]
    pub idle_timeout_ms: u64,
}

/// Supervisor configuration resolved from the command line
#[derive(Debug, Clone)]
pub struct InitConfig {
    pub socket_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    pub health_interval: Duration,
    pub watch_endpoints: bool,
}

impl InitConfig {
    pub fn from_cli(cli: InitCli) -> Result<Self> {
        if cli.services.is_empty() {
            return Err(eyre!("at least one service must be managed"));
        }
        if cli.health_interval_ms == 0 {
            return Err(eyre!("health interval must be greater than zero"));
        }

        let service_bin_dir = match cli.service_bin_dir {
            Some(dir) => dir,
            None => std::env::current_exe()?
                .parent()
                .map(PathBuf::from)
                .ok_or_else(|| eyre!("cannot determine the directory of the init binary"))?,
        };

        let mut services = cli.services;
        services.sort();
        services.dedup();

        let specs = services
            .into_iter()
            .map(|id| {
                ServiceSpec::for_binary(
                    id,
                    &service_bin_dir,
                    &cli.socket_dir,
                    Duration::from_millis(cli.startup_delay_ms),
                )
            })
            .collect();

        Ok(InitConfig {
            socket_dir: cli.socket_dir,
            supervisor: SupervisorConfig {
                specs,
                activation: cli.activation || cli.on_demand,
                on_demand: cli.on_demand,
                bind_timeout: Duration::from_millis(cli.bind_timeout_ms),
                graceful_shutdown_timeout: Duration::from_millis(cli.graceful_timeout_ms),
                restart_policy: RestartPolicy {
                    max_restarts: cli.max_restarts,
                    window: Duration::from_millis(cli.restart_window_ms),
                },
                ..Default::default()
            },
            health_interval: Duration::from_millis(cli.health_interval_ms),
            watch_endpoints: !cli.no_watch,
        })
    }
}

/// Probe configuration resolved from the command line
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub probe: ProbeConfig,
    pub continuous: bool,
    pub interval: Duration,
}

impl PingConfig {
    pub fn from_cli(cli: PingCli) -> Result<Self> {
        if cli.max_attempts == 0 {
            return Err(eyre!("max attempts must be at least 1"));
        }
        if cli.initial_backoff_ms > cli.max_backoff_ms {
            return Err(eyre!(
                "initial backoff {}ms exceeds max backoff {}ms",
                cli.initial_backoff_ms,
                cli.max_backoff_ms
            ));
        }

        let mut services = cli.services;
        services.sort();
        services.dedup();

        let targets = services
            .into_iter()
            .map(|id| (id, id.socket_path(&cli.socket_dir)))
            .collect();

        Ok(PingConfig {
            probe: ProbeConfig {
                targets,
                connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
                response_timeout: Duration::from_millis(cli.response_timeout_ms),
                max_attempts: cli.max_attempts,
                backoff: Backoff {
                    initial: Duration::from_millis(cli.initial_backoff_ms),
                    max: Duration::from_millis(cli.max_backoff_ms),
                },
                endpoint_budget: Duration::from_millis(cli.endpoint_budget_ms),
                overall_budget: Duration::from_millis(cli.budget_ms),
            },
            continuous: cli.continuous,
            interval: Duration::from_millis(cli.interval_ms),
        })
    }
}

impl ServiceConfig {
    pub fn from_cli(id: ServiceId, cli: ServiceCli) -> Self {
        ServiceConfig {
            id,
            socket_path: cli.socket.unwrap_or_else(|| id.socket_path(&cli.socket_dir)),
            startup_delay: Duration::from_millis(cli.startup_delay_ms),
            idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        }
    }
}
