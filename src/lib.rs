//! Socket-activated service supervision over Unix domain sockets.
//!
//! The crate ships five binaries sharing this library:
//! `init` (the supervisor), `ping` (the liveness probe) and the three
//! backing services `service-a`, `service-b` and `service-c`.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod activation;
pub mod cli;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod identity;
pub mod probe;
pub mod protocol;
pub mod service;
pub mod signals;
pub mod supervisor;
pub mod watcher;

pub use endpoint::{BindState, Endpoint};
pub use environment::Environment;
pub use identity::ServiceId;
pub use probe::{LivenessResult, ProbeReport};
pub use supervisor::{ServiceState, ServiceStatus, Supervisor};

/// Installs the error report hook and the tracing subscriber.
///
/// Verbosity is read from `RUST_LOG`; it never affects protocol behaviour.
pub fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    Ok(())
}
