use clap::Parser;
use sockinit::cli::ServiceCli;
use sockinit::service::{self, ServiceConfig};
use sockinit::ServiceId;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> sockinit::Result<ExitCode> {
    sockinit::init_tracing()?;

    let config = ServiceConfig::from_cli(ServiceId::C, ServiceCli::parse());
    Ok(service::run(config).await)
}
