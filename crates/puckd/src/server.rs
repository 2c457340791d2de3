use std::sync::Arc;

use puck_common::{Error, Result, Status};
use puck_manager::{CreateOpts, Manager, SnapshotCreateOpts, SnapshotRestoreOpts};
use puck_router::Router;
use puck_runtime::ContainerRuntime;
use puck_store::Store;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::{Request, Response};

/// Upper bound on a request frame; anything larger is a broken client.
const MAX_FRAME_BYTES: usize = 1 << 20;

pub struct Daemon {
    cfg: Config,
    manager: Arc<Manager>,
    router: Arc<Router>,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct DestroyParams {
    name: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct ForceParams {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct PuckNameParams {
    puck_name: String,
}

#[derive(Deserialize)]
struct SnapshotRefParams {
    puck_name: String,
    snapshot_name: String,
}

fn parse<T: DeserializeOwned>(data: Option<serde_json::Value>) -> Result<T> {
    serde_json::from_value(data.unwrap_or(serde_json::Value::Null))
        .map_err(|e| Error::Precondition(format!("invalid request data: {e}")))
}

impl Daemon {
    pub async fn new(cfg: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Daemon> {
        cfg.ensure_data_dir()?;
        let store = Arc::new(Store::open(&cfg.database_path()).await?);
        let manager = Arc::new(Manager::new(runtime, store, cfg.manager_config()));
        let router = Router::new(cfg.router_config());
        Ok(Daemon {
            cfg,
            manager,
            router,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Serve the control socket until `shutdown` flips. Binding the socket
    /// or opening the store is fatal; a router that fails to start only
    /// degrades ingress.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.cfg.daemon_socket.clone();
        if let Some(dir) = socket.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Fatal(format!("creating socket directory: {e}")))?;
        }
        // A stale socket from a previous run would make bind fail.
        let _ = tokio::fs::remove_file(&socket).await;

        let listener = UnixListener::bind(&socket)
            .map_err(|e| Error::Fatal(format!("binding control socket: {e}")))?;
        info!(socket = %socket.display(), "daemon listening");

        match self.router.clone().start().await {
            Ok(addr) => info!(%addr, "http router started"),
            Err(e) => warn!(error = %e, "failed to start http router, continuing without ingress"),
        }

        self.reconcile_routes().await;

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.clone();
                        tokio::spawn(async move { daemon.handle_connection(stream).await });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }

        self.router.stop();
        let _ = tokio::fs::remove_file(&socket).await;
        info!("daemon stopped");
        Ok(())
    }

    /// Rebuild the routing table from the store so ingress reflects durable
    /// state after a restart. Runs once at startup, before the accept loop.
    pub async fn reconcile_routes(&self) {
        match self.manager.list().await {
            Ok(pucks) => {
                for p in &pucks {
                    if p.status == Status::Running && p.host_port > 0 {
                        self.router.add_route(&p.name, "127.0.0.1", p.host_port);
                    }
                }
                debug!(routes = self.router.routes().len(), "routes reconciled");
            }
            Err(e) => warn!(error = %e, "failed to list pucks for route reconciliation"),
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        let request = match read_request(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                let _ = write_response(&mut stream, &Response::err(e.to_string())).await;
                return;
            }
        };

        debug!(action = %request.action, "handling request");
        let response = self.handle_request(request).await;
        if let Err(e) = write_response(&mut stream, &response).await {
            debug!(error = %e, "failed to write response");
        }
    }

    async fn handle_request(&self, req: Request) -> Response {
        match req.action.as_str() {
            "ping" => Response::ok(),
            "create" => self.handle_create(req.data).await,
            "list" => match self.manager.list().await {
                Ok(pucks) => Response::with_data(&pucks),
                Err(e) => Response::err(e.to_string()),
            },
            "get" => self.handle_get(req.data).await,
            "start" => self.handle_start(req.data).await,
            "stop" => self.handle_stop(req.data).await,
            "destroy" => self.handle_destroy(req.data).await,
            "destroy-all" => self.handle_destroy_all(req.data).await,
            "snapshot-create" => self.handle_snapshot_create(req.data).await,
            "snapshot-restore" => self.handle_snapshot_restore(req.data).await,
            "snapshot-list" => self.handle_snapshot_list(req.data).await,
            "snapshot-delete" => self.handle_snapshot_delete(req.data).await,
            other => Response::err(format!("unknown action: {other}")),
        }
    }

    async fn handle_create(&self, data: Option<serde_json::Value>) -> Response {
        let opts: CreateOpts = match parse(data) {
            Ok(opts) => opts,
            Err(e) => return Response::err(e.to_string()),
        };
        match self.manager.create(opts).await {
            Ok(puck) => {
                if puck.host_port > 0 {
                    self.router.add_route(&puck.name, "127.0.0.1", puck.host_port);
                }
                Response::with_data(&puck)
            }
            Err(e) => Response::err(e.to_string()),
        }
    }

    async fn handle_get(&self, data: Option<serde_json::Value>) -> Response {
        let params: NameParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        match self.manager.get(&params.name).await {
            Ok(puck) => Response::with_data(&puck),
            Err(e) => Response::err(e.to_string()),
        }
    }

    async fn handle_start(&self, data: Option<serde_json::Value>) -> Response {
        let params: NameParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        if let Err(e) = self.manager.start(&params.name).await {
            return Response::err(e.to_string());
        }
        if let Ok(puck) = self.manager.get(&params.name).await {
            if puck.host_port > 0 {
                self.router.add_route(&puck.name, "127.0.0.1", puck.host_port);
            }
        }
        Response::ok()
    }

    async fn handle_stop(&self, data: Option<serde_json::Value>) -> Response {
        let params: NameParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        if let Err(e) = self.manager.stop(&params.name).await {
            return Response::err(e.to_string());
        }
        self.router.remove_route(&params.name);
        Response::ok()
    }

    async fn handle_destroy(&self, data: Option<serde_json::Value>) -> Response {
        let params: DestroyParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        if let Err(e) = self.manager.destroy(&params.name, params.force).await {
            return Response::err(e.to_string());
        }
        self.router.remove_route(&params.name);
        Response::ok()
    }

    async fn handle_destroy_all(&self, data: Option<serde_json::Value>) -> Response {
        let params: ForceParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        let outcome = match self.manager.destroy_all(params.force).await {
            Ok(outcome) => outcome,
            Err(e) => return Response::err(e.to_string()),
        };

        for name in &outcome.destroyed {
            self.router.remove_route(name);
        }

        if outcome.failures.is_empty() {
            Response::with_data(&outcome.destroyed)
        } else {
            let mut resp = Response::with_data(&outcome.destroyed);
            resp.success = false;
            resp.error = Some(format!(
                "failed to destroy some pucks: {}",
                outcome.failures.join("; ")
            ));
            resp
        }
    }

    async fn handle_snapshot_create(&self, data: Option<serde_json::Value>) -> Response {
        let opts: SnapshotCreateOpts = match parse(data) {
            Ok(opts) => opts,
            Err(e) => return Response::err(e.to_string()),
        };
        let leave_running = opts.leave_running;
        let puck_name = opts.puck_name.clone();
        match self.manager.snapshot_create(opts).await {
            Ok(snapshot) => {
                // A checkpointed puck no longer serves traffic.
                if !leave_running {
                    self.router.remove_route(&puck_name);
                }
                Response::with_data(&snapshot)
            }
            Err(e) => Response::err(e.to_string()),
        }
    }

    async fn handle_snapshot_restore(&self, data: Option<serde_json::Value>) -> Response {
        let opts: SnapshotRestoreOpts = match parse(data) {
            Ok(opts) => opts,
            Err(e) => return Response::err(e.to_string()),
        };
        match self.manager.snapshot_restore(opts).await {
            Ok(puck) => {
                if puck.host_port > 0 {
                    self.router.add_route(&puck.name, "127.0.0.1", puck.host_port);
                }
                Response::ok()
            }
            Err(e) => Response::err(e.to_string()),
        }
    }

    async fn handle_snapshot_list(&self, data: Option<serde_json::Value>) -> Response {
        let params: PuckNameParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        match self.manager.snapshot_list(&params.puck_name).await {
            Ok(snapshots) => Response::with_data(&snapshots),
            Err(e) => Response::err(e.to_string()),
        }
    }

    async fn handle_snapshot_delete(&self, data: Option<serde_json::Value>) -> Response {
        let params: SnapshotRefParams = match parse(data) {
            Ok(p) => p,
            Err(e) => return Response::err(e.to_string()),
        };
        match self
            .manager
            .snapshot_delete(&params.puck_name, &params.snapshot_name)
            .await
        {
            Ok(()) => Response::ok(),
            Err(e) => Response::err(e.to_string()),
        }
    }
}

/// Read one JSON object off the stream, stopping at the decoder's natural
/// end-of-object.
async fn read_request(stream: &mut UnixStream) -> Result<Request> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            let mut objects = serde_json::Deserializer::from_slice(&buf).into_iter::<Request>();
            match objects.next() {
                Some(Ok(request)) => return Ok(request),
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(e)) => {
                    return Err(Error::Precondition(format!("invalid request: {e}")))
                }
                None => {}
            }
        }
        if buf.len() > MAX_FRAME_BYTES {
            return Err(Error::Precondition("request frame too large".into()));
        }

        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Internal(format!("reading request: {e}")))?;
        if n == 0 {
            return Err(Error::Precondition(
                "connection closed before a complete request".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let mut payload = serde_json::to_vec(response)
        .map_err(|e| Error::Internal(format!("encoding response: {e}")))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .await
        .map_err(|e| Error::Internal(format!("writing response: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| Error::Internal(format!("closing connection: {e}")))?;
    Ok(())
}

