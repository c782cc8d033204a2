//! End-to-end startup and shutdown of the manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nsmgr::config::Endpoint;
use nsmgr::lifecycle::{LifecycleState, ShutdownCause};
use nsmgr::{run_manager, Manager, ManagerError, ProcessContext};
use tokio::net::UnixStream;

mod common;

#[tokio::test]
async fn standalone_manager_serves_tcp_and_unix() {
    let dir = tempfile::tempdir().unwrap();
    let socket = common::unix_socket(dir.path());
    let config = common::config(vec![Endpoint::tcp("0.0.0.0", 0), socket.clone()], None);

    let manager = Manager::start(ProcessContext::new(), Arc::new(config), common::collaborators())
        .await
        .unwrap();

    assert!(manager.registry().is_none());
    assert_eq!(manager.public_url(), format!("tcp://{}:0", common::HOST_IP));
    assert_eq!(manager.bound().len(), 2);

    let path = socket.path().unwrap();
    let (status, body) = common::http_get(UnixStream::connect(path).await.unwrap(), "/healthz").await;
    assert_eq!((status, body.as_str()), (200, "ok"));

    let (status, body) = common::http_get(UnixStream::connect(path).await.unwrap(), "/manager").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["name"], "nsmgr-test");
    assert_eq!(json["mode"], "standalone");

    let port = manager.bound()[0].local_addr.unwrap().port();
    let peer = common::peer_identity().await;
    let (status, _) = common::http_get(common::tls_connect(&peer, port).await, "/healthz").await;
    assert_eq!(status, 200);
    peer.close();

    manager.stop().await;
    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert!(!path.exists());
}

#[tokio::test]
async fn unreachable_registry_fails_before_any_listener() {
    let dir = tempfile::tempdir().unwrap();
    let socket = common::unix_socket(dir.path());
    let registry = Endpoint::tcp("127.0.0.1", common::closed_port());
    let config = common::config(vec![socket.clone()], Some(registry));

    let started = Instant::now();
    let err = Manager::start(ProcessContext::new(), Arc::new(config), common::collaborators())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ManagerError::RegistryUnreachable(_)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!socket.path().unwrap().exists());
}

#[tokio::test]
async fn occupied_port_fails_startup() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(
        vec![common::unix_socket(dir.path()), Endpoint::tcp("127.0.0.1", port)],
        None,
    );
    let ctx = ProcessContext::new();

    let err = Manager::start(ctx.clone(), Arc::new(config), common::collaborators())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ManagerError::ListenerBindFailure(_)));
    assert!(!ctx.is_cancelled());
}

#[tokio::test]
async fn run_returns_after_external_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let socket = common::unix_socket(dir.path());
    let config = common::config(vec![socket.clone()], None);
    let ctx = ProcessContext::new();

    let run = tokio::spawn(run_manager(
        ctx.clone(),
        Arc::new(config),
        common::collaborators(),
    ));

    let path = socket.path().unwrap().to_path_buf();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    ctx.cancel(ShutdownCause::Signal("SIGINT"));
    let cause = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(cause, ShutdownCause::Signal("SIGINT"));
    assert!(!path.exists());
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(vec![common::unix_socket(dir.path())], None);
    let manager = Manager::start(ProcessContext::new(), Arc::new(config), common::collaborators())
        .await
        .unwrap();

    manager.stop().await;
    manager.stop().await;

    assert_eq!(manager.state(), LifecycleState::Stopped);
    assert!(manager.identity().is_closed());
    assert_eq!(manager.context().cause(), Some(ShutdownCause::Stopped));
}
