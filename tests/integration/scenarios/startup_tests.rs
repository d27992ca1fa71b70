use crate::infrastructure::{ProcessTestHarness, SocketTestUtils};
use anyhow::Result;
use sockinit::ServiceId;
use std::time::Duration;
use tracing::info;

const BIND_WAIT: Duration = Duration::from_secs(5);

/// init brings up all three services with their well-known socket names
#[tokio::test]
async fn test_all_services_bound() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&[]).await?;

    for id in ServiceId::ALL {
        let path = harness.socket_path(id);
        assert!(
            SocketTestUtils::wait_for_socket(&path, BIND_WAIT).await,
            "{} was never bound",
            path.display()
        );
        SocketTestUtils::assert_answers_as(&path, id).await?;
    }

    assert!(init.is_running(), "init should keep running");
    info!("all services answered after {:?}", init.runtime());

    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(status.success(), "healthy shutdown should exit 0, got {status:?}");
    Ok(())
}

/// Socket files left over from a crashed run do not block startup
#[tokio::test]
async fn test_startup_over_stale_sockets() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    for id in ServiceId::ALL {
        SocketTestUtils::create_stale_socket(&harness.socket_path(id))?;
    }

    let mut init = harness.spawn_init(&[]).await?;

    // The stale files exist from the start, so wait for real answers
    for id in ServiceId::ALL {
        let path = harness.socket_path(id);
        let deadline = tokio::time::Instant::now() + BIND_WAIT;
        loop {
            match SocketTestUtils::assert_answers_as(&path, id).await {
                Ok(()) => break,
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    init.terminate(Duration::from_secs(5)).await?;
    Ok(())
}

/// One unbindable endpoint leaves the other two services running
#[tokio::test]
async fn test_partial_failure_keeps_other_services() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let blocked = harness.socket_path(ServiceId::B);
    std::fs::create_dir(&blocked)?;
    std::fs::write(blocked.join("occupied"), b"x")?;

    let mut init = harness.spawn_init(&["--max-restarts", "1"]).await?;

    for id in [ServiceId::A, ServiceId::C] {
        let path = harness.socket_path(id);
        assert!(SocketTestUtils::wait_for_socket(&path, BIND_WAIT).await);
        SocketTestUtils::assert_answers_as(&path, id).await?;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(init.is_running(), "init must survive a failed service");
    assert!(blocked.is_dir(), "the conflicting directory must be left alone");

    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(!status.success(), "a failed service should make init exit non-zero");
    Ok(())
}

/// A service run by hand binds its well-known path and answers as itself
#[tokio::test]
async fn test_standalone_service_binary() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut service = harness.spawn_service(ServiceId::C, &[]).await?;

    let path = harness.socket_path(ServiceId::C);
    assert!(SocketTestUtils::wait_for_socket(&path, BIND_WAIT).await);
    SocketTestUtils::assert_answers_as(&path, ServiceId::C).await?;

    let status = service.terminate(Duration::from_secs(3)).await?;
    assert!(status.success());
    assert!(
        SocketTestUtils::wait_for_removal(&path, Duration::from_secs(1)).await,
        "service should unlink the socket it created"
    );
    Ok(())
}

/// A second copy of a service cannot take over a live endpoint
#[tokio::test]
async fn test_second_service_instance_exits_with_bind_failure() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut first = harness.spawn_service(ServiceId::A, &[]).await?;
    let path = harness.socket_path(ServiceId::A);
    assert!(SocketTestUtils::wait_for_socket(&path, BIND_WAIT).await);

    let mut second = harness.spawn_service(ServiceId::A, &[]).await?;
    let status = second
        .wait_for_exit_timeout(Duration::from_secs(3))
        .await?
        .expect("second instance should give up");
    assert_eq!(status.code(), Some(i32::from(sockinit::service::EXIT_BIND_FAILED)));

    SocketTestUtils::assert_answers_as(&path, ServiceId::A).await?;
    first.terminate(Duration::from_secs(3)).await?;
    Ok(())
}
