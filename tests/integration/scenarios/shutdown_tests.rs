use crate::infrastructure::{bin_dir, ProcessTestHarness, SocketTestUtils};
use anyhow::Result;
use nix::sys::signal::Signal;
use sockinit::endpoint::{self, Endpoint};
use sockinit::supervisor::{ServiceSpec, Supervisor, SupervisorConfig};
use sockinit::{ServiceId, ServiceState};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

fn supervisor_config(socket_dir: &Path) -> SupervisorConfig {
    SupervisorConfig {
        specs: ServiceId::ALL
            .iter()
            .map(|id| ServiceSpec::for_binary(*id, &bin_dir(), socket_dir, Duration::ZERO))
            .collect(),
        ..Default::default()
    }
}

/// SIGTERM makes init stop every service and remove every socket
#[tokio::test]
async fn test_sigterm_cleans_up_sockets() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&[]).await?;
    for id in ServiceId::ALL {
        assert!(SocketTestUtils::wait_for_socket(&harness.socket_path(id), Duration::from_secs(5)).await);
    }

    let started = std::time::Instant::now();
    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(status.success(), "{status:?}");
    assert!(started.elapsed() < Duration::from_secs(3));

    for id in ServiceId::ALL {
        let path = harness.socket_path(id);
        assert!(!path.exists(), "{} left behind", path.display());
        assert!(!endpoint::is_live(&path));
    }
    Ok(())
}

/// SIGINT is handled like SIGTERM
#[tokio::test]
async fn test_sigint_shuts_down() -> Result<()> {
    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&[]).await?;
    assert!(SocketTestUtils::wait_for_socket(&harness.socket_path(ServiceId::C), Duration::from_secs(5)).await);

    init.signal(Signal::SIGINT)?;
    let status = init.wait_for_exit_timeout(Duration::from_secs(5)).await?;
    assert!(status.is_some(), "init should exit on SIGINT");
    Ok(())
}

/// In-process supervisor: shutdown leaves nothing behind and can be repeated
#[tokio::test]
async fn test_supervisor_shutdown_is_idempotent() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempdir()?;
    let mut supervisor = Supervisor::new(supervisor_config(dir.path()));

    assert_eq!(supervisor.start_all().await, 3);
    assert!(supervisor.all_ready());

    let pids: Vec<i32> = supervisor.snapshot().iter().filter_map(|s| s.pid).collect();
    assert_eq!(pids.len(), 3);

    supervisor.shutdown_all().await;
    supervisor.shutdown_all().await;

    for status in supervisor.snapshot() {
        assert_eq!(status.state, ServiceState::Terminated);
        assert!(!status.socket_path.exists());
    }
    for pid in pids {
        assert!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err(),
            "service {pid} outlived shutdown"
        );
    }
    Ok(())
}

/// Removing an endpoint twice is harmless
#[tokio::test]
async fn test_double_unlink() -> Result<()> {
    let dir = tempdir()?;
    let mut endpoint = Endpoint::in_dir(ServiceId::A, dir.path());
    endpoint.create()?;
    let _listener = endpoint.bind()?;
    assert!(endpoint.is_socket_on_disk());

    endpoint.unlink()?;
    endpoint.unlink()?;
    endpoint::unlink_path(endpoint.path())?;
    assert!(!endpoint.path().exists());
    Ok(())
}

/// Deleting a socket under a running init gets the service restarted by the
/// endpoint watcher, well before any bind timeout could kick in
#[tokio::test]
async fn test_removed_socket_is_restored() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&["--bind-timeout-ms", "5000"]).await?;
    let path = harness.socket_path(ServiceId::A);

    // Only delete once startup is over and every service answers
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let output = harness.run_ping(&[]).await?;
        if output.status.success() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "services never became reachable");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let removed_at = std::time::Instant::now();
    std::fs::remove_file(&path)?;
    assert!(
        SocketTestUtils::wait_for_socket(&path, Duration::from_secs(5)).await,
        "init should restart the service behind the deleted socket"
    );
    let restored_after = removed_at.elapsed();
    assert!(
        restored_after < Duration::from_secs(2),
        "restore took {restored_after:?}, the watcher path was not taken"
    );
    SocketTestUtils::assert_answers_as(&path, ServiceId::A).await?;

    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(status.success(), "{status:?}");
    Ok(())
}
