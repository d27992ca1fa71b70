use clap::Parser;
use sockinit::cli::{PingCli, PingConfig};
use sockinit::probe::Probe;
use sockinit::signals::{signal_name, Signals};
use std::process::ExitCode;
use tokio::select;
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> sockinit::Result<ExitCode> {
    sockinit::init_tracing()?;

    let config = PingConfig::from_cli(PingCli::parse())?;
    let probe = Probe::new(config.probe.clone());

    if !config.continuous {
        let report = probe.run().await;
        println!("{report}");
        return Ok(exit_code(report.all_reachable()));
    }

    // Continuous mode: probe until interrupted, exit with the last verdict
    let mut signals = Signals::new()?;
    let mut healthy = false;
    loop {
        select! {
            report = probe.run() => {
                println!("{report}");
                healthy = report.all_reachable();
                if !healthy {
                    warn!("{} endpoints failing", report.failures().count());
                }
            }
            Some(kind) = signals.next() => {
                info!("received {}, stopping probe", signal_name(kind));
                break;
            }
        }

        select! {
            _ = sleep(config.interval) => {}
            Some(kind) = signals.next() => {
                info!("received {}, stopping probe", signal_name(kind));
                break;
            }
        }
    }

    Ok(exit_code(healthy))
}

fn exit_code(healthy: bool) -> ExitCode {
    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
