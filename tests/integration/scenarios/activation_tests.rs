use crate::infrastructure::{bin_dir, ProcessTestHarness, SocketTestUtils};
use anyhow::Result;
use sockinit::supervisor::{ServiceSpec, Supervisor, SupervisorConfig};
use sockinit::ServiceId;
use std::time::Duration;
use tempfile::tempdir;

/// With activation, init binds every socket and the services adopt them
#[tokio::test]
async fn test_activation_mode_serves_all() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&["--activation"]).await?;

    for id in ServiceId::ALL {
        let path = harness.socket_path(id);
        assert!(SocketTestUtils::wait_for_socket(&path, Duration::from_secs(5)).await);
        SocketTestUtils::assert_answers_as(&path, id).await?;
    }

    let output = harness.run_ping(&[]).await?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stdout));

    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(status.success());
    for id in ServiceId::ALL {
        assert!(!harness.socket_path(id).exists());
    }
    Ok(())
}

/// Queries sent while a slow service is still starting queue in the backlog
/// of the socket init already bound, and are answered once it serves
#[tokio::test]
async fn test_activation_queues_early_queries() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempdir()?;
    let specs = ServiceId::ALL
        .iter()
        .map(|id| ServiceSpec::for_binary(*id, &bin_dir(), dir.path(), Duration::from_millis(400)))
        .collect();
    let mut supervisor = Supervisor::new(SupervisorConfig {
        specs,
        activation: true,
        ..Default::default()
    });

    assert_eq!(supervisor.start_all().await, 3);

    // The socket exists from the moment start_all returns, so the query
    // lands in the backlog while the service sleeps
    let path = ServiceId::B.socket_path(dir.path());
    let response = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match SocketTestUtils::assert_answers_as(&path, ServiceId::B).await {
                Ok(()) => return,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;
    assert!(response.is_ok(), "service B never answered on the activated socket");

    supervisor.shutdown_all().await;
    assert!(!path.exists());
    Ok(())
}

/// With --on-demand no service runs until a client connects; the first
/// query is then answered by the freshly spawned service
#[tokio::test]
async fn test_on_demand_spawns_on_first_query() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut init = harness.spawn_init(&["--on-demand"]).await?;

    for id in ServiceId::ALL {
        assert!(SocketTestUtils::wait_for_socket(&harness.socket_path(id), Duration::from_secs(5)).await);
    }

    // The query waits in the backlog while init starts the service
    let output = harness.run_ping(&[]).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    assert!(stdout.contains("all 3 endpoints reachable"), "{stdout}");

    for id in ServiceId::ALL {
        SocketTestUtils::assert_answers_as(&harness.socket_path(id), id).await?;
    }

    let status = init.terminate(Duration::from_secs(5)).await?;
    assert!(status.success(), "{status:?}");
    for id in ServiceId::ALL {
        assert!(!harness.socket_path(id).exists());
    }
    Ok(())
}

/// In-process: an on-demand endpoint is connectable before its service runs
#[tokio::test]
async fn test_on_demand_supervisor_defers_spawn() -> Result<()> {
    let dir = tempdir()?;
    let mut supervisor = Supervisor::new(SupervisorConfig {
        specs: vec![ServiceSpec::for_binary(ServiceId::A, &bin_dir(), dir.path(), Duration::ZERO)],
        on_demand: true,
        ..Default::default()
    });

    assert_eq!(supervisor.start_all().await, 1);
    assert!(supervisor.status(ServiceId::A).and_then(|s| s.pid).is_none());

    let path = ServiceId::A.socket_path(dir.path());
    let client = tokio::spawn(async move { SocketTestUtils::query(&path, "first").await });

    let id = tokio::time::timeout(Duration::from_secs(2), supervisor.next_demand()).await?;
    assert!(supervisor.activate(id).await);

    let response = client.await??;
    assert_eq!(
        response,
        sockinit::protocol::Response::Pong {
            service: ServiceId::A,
            nonce: "first".to_string()
        }
    );

    supervisor.shutdown_all().await;
    Ok(())
}
