//! End-to-end dispatcher tests: a real daemon on a real Unix socket,
//! driven through the client, with the mock runtime standing in for the
//! container engine.

use std::sync::Arc;

use puck_common::Status;
use puck_manager::CreateOpts;
use puck_runtime::mock::MockRuntime;
use puck_runtime::ContainerRuntime;
use puckd::client::ClientError;
use puckd::protocol::Request;
use puckd::{Client, Config, Daemon};
use tokio::sync::watch;

struct Fixture {
    daemon: Arc<Daemon>,
    runtime: Arc<MockRuntime>,
    client: Client,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn spawn_daemon() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        data_dir: dir.path().to_path_buf(),
        daemon_socket: dir.path().join("puckd.sock"),
        router_port: 0,
        ..Default::default()
    };
    let socket = cfg.daemon_socket.clone();

    let runtime = Arc::new(MockRuntime::new());
    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime.clone();
    let daemon = Arc::new(Daemon::new(cfg, runtime_dyn).await.unwrap());

    let (shutdown, shutdown_rx) = watch::channel(false);
    let serving = daemon.clone();
    tokio::spawn(async move { serving.run(shutdown_rx).await });

    // Wait for the socket to come up.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Fixture {
        daemon,
        runtime,
        client: Client::new(socket),
        shutdown,
        _dir: dir,
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[tokio::test]
async fn ping_and_unknown_action() {
    let f = spawn_daemon().await;
    f.client.ping().await.unwrap();

    let err = f
        .client
        .raw(&Request {
            action: "frobnicate".into(),
            data: None,
        })
        .await
        .unwrap();
    assert!(!err.success);
    assert_eq!(err.error.as_deref(), Some("unknown action: frobnicate"));
}

#[tokio::test]
async fn create_returns_running_puck_and_adds_route() {
    let f = spawn_daemon().await;
    let puck = f
        .client
        .create(CreateOpts {
            name: "myapp".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(puck.name, "myapp");
    assert_eq!(puck.status, Status::Running);
    assert_eq!(puck.host_port, 9000);

    let routes = f.daemon.router().routes();
    assert_eq!(routes.get("myapp").map(|t| t.port), Some(9000));
}

#[tokio::test]
async fn stop_and_start_track_routes() {
    let f = spawn_daemon().await;
    f.client
        .create(CreateOpts {
            name: "web".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    f.client.stop("web").await.unwrap();
    assert!(f.daemon.router().routes().get("web").is_none());

    f.client.start("web").await.unwrap();
    assert!(f.daemon.router().routes().get("web").is_some());
}

#[tokio::test]
async fn destroy_removes_route_and_record() {
    let f = spawn_daemon().await;
    f.client
        .create(CreateOpts {
            name: "gone".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    f.client.destroy("gone", true).await.unwrap();
    assert!(f.daemon.router().routes().is_empty());
    let err = f.client.get("gone").await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn destroy_all_reports_partial_success() {
    let f = spawn_daemon().await;
    f.client
        .create(CreateOpts {
            name: "ok".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let bad = f
        .client
        .create(CreateOpts {
            name: "bad".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    f.runtime.fail_remove_refs.lock().unwrap().push(bad.id);

    let err = f.client.destroy_all(true).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("bad"), "error should name the failure: {msg}");
    match err {
        ClientError::PartialDestroy { destroyed, .. } => {
            assert_eq!(destroyed, vec!["ok".to_string()]);
        }
        other => panic!("expected partial destroy error, got {other}"),
    }
}

#[tokio::test]
async fn snapshot_cycle_tracks_routes_and_identity() {
    let f = spawn_daemon().await;
    let original = f
        .client
        .create(CreateOpts {
            name: "phoenix".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Non-leaveRunning checkpoint drops the route.
    let snap = f
        .client
        .snapshot_create("phoenix", "snap1", false)
        .await
        .unwrap();
    assert!(snap.path.is_file());
    assert!(f.daemon.router().routes().get("phoenix").is_none());
    let p = f.client.get("phoenix").await.unwrap();
    assert_eq!(p.status, Status::Checkpointed);

    // Restore brings the route back on the original port, under a new
    // runtime id.
    f.client.snapshot_restore("phoenix", "snap1").await.unwrap();
    let restored = f.client.get("phoenix").await.unwrap();
    assert_ne!(restored.id, original.id);
    assert_eq!(restored.status, Status::Running);
    let routes = f.daemon.router().routes();
    assert_eq!(
        routes.get("phoenix").map(|t| t.port),
        Some(original.host_port)
    );

    let listed = f.client.snapshot_list("phoenix").await.unwrap();
    assert_eq!(listed.len(), 1);

    f.client.snapshot_delete("phoenix", "snap1").await.unwrap();
    assert!(f.client.snapshot_list("phoenix").await.unwrap().is_empty());
}

#[tokio::test]
async fn startup_reconciliation_restores_routes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        data_dir: dir.path().to_path_buf(),
        daemon_socket: dir.path().join("puckd.sock"),
        router_port: 0,
        ..Default::default()
    };
    let runtime_dyn: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());

    // Seed state through a first daemon instance.
    let daemon = Arc::new(Daemon::new(cfg.clone(), runtime_dyn.clone()).await.unwrap());
    daemon
        .manager()
        .create(CreateOpts {
            name: "survivor".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(daemon.router().routes().is_empty());

    // A fresh daemon over the same store rebuilds the table.
    let restarted = Arc::new(Daemon::new(cfg, runtime_dyn).await.unwrap());
    restarted.reconcile_routes().await;
    let routes = restarted.router().routes();
    assert_eq!(routes.get("survivor").map(|t| t.port), Some(9000));
}
