//! HTTP ingress for pucks. One in-process reverse proxy serves a directory
//! page at `/` and forwards `/<name>/*` to `127.0.0.1:<routing_port>`,
//! stripping the name prefix. The routing table is a cache of running pucks:
//! the dispatcher rebuilds it from the store at startup and mutates it after
//! every state change, so losing it never loses data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router as AxumRouter;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use puck_common::{Error, Result};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type HttpClient = Client<HttpConnector, Body>;

/// Forward target for one puck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub port: u16,
    /// Advertised hostname for the primary listener.
    pub domain: String,
    /// When set, a second listener on 443 serves the same routes under
    /// `<domain>.<tailnet>`.
    pub tailnet: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            domain: "localhost".to_string(),
            tailnet: None,
        }
    }
}

pub struct Router {
    cfg: RouterConfig,
    /// Writers publish a fresh immutable snapshot; proxy requests clone the
    /// Arc and never block on a mutation.
    routes: RwLock<Arc<HashMap<String, RouteTarget>>>,
    client: HttpClient,
    stop_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Router {
    pub fn new(cfg: RouterConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            routes: RwLock::new(Arc::new(HashMap::new())),
            client: Client::builder(TokioExecutor::new()).build_http(),
            stop_tx,
            local_addr: Mutex::new(None),
        })
    }

    /// Add or replace the route for a puck. Safe to call whether or not the
    /// listener is up.
    pub fn add_route(&self, name: &str, host: &str, port: u16) {
        let mut guard = self.routes.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(
            name.to_string(),
            RouteTarget {
                host: host.to_string(),
                port,
            },
        );
        *guard = Arc::new(next);
        debug!(name, host, port, "route added");
    }

    pub fn remove_route(&self, name: &str) {
        let mut guard = self.routes.write().unwrap();
        if !guard.contains_key(name) {
            return;
        }
        let mut next = (**guard).clone();
        next.remove(name);
        *guard = Arc::new(next);
        debug!(name, "route removed");
    }

    /// Current table snapshot.
    pub fn routes(&self) -> Arc<HashMap<String, RouteTarget>> {
        self.routes.read().unwrap().clone()
    }

    /// Bind and serve the ingress listener(s). Returns the primary bound
    /// address. Callers may treat failure as non-fatal: the routing table
    /// keeps working and only ingress is degraded.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr> {
        if let Some(addr) = *self.local_addr.lock().unwrap() {
            return Ok(addr);
        }

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.cfg.port))
            .await
            .map_err(|e| Error::Unavailable(format!("binding ingress listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("reading listener address: {e}")))?;
        *self.local_addr.lock().unwrap() = Some(addr);

        spawn_serve(self.clone(), listener);
        info!(%addr, domain = %self.cfg.domain, "ingress listening");

        if let Some(tailnet) = self.cfg.tailnet.clone() {
            match tokio::net::TcpListener::bind(("0.0.0.0", 443)).await {
                Ok(listener) => {
                    spawn_serve(self.clone(), listener);
                    info!(identity = %format!("{}.{tailnet}", self.cfg.domain), "tailnet ingress listening on 443");
                }
                Err(e) => warn!(error = %e, "failed to bind tailnet listener"),
            }
        }

        Ok(addr)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        *self.local_addr.lock().unwrap() = None;
    }

    fn directory_page(&self) -> String {
        let routes = self.routes();
        if routes.is_empty() {
            return "No pucks found. Create one with: puck create <name>".to_string();
        }
        let mut names: Vec<&String> = routes.keys().collect();
        names.sort();
        let mut page = String::from("Available pucks:\n");
        for name in names {
            page.push_str("  /");
            page.push_str(name);
            page.push('\n');
        }
        page
    }

    async fn proxy(
        &self,
        mut req: Request<Body>,
        name: &str,
        target: &RouteTarget,
    ) -> Result<Response<Body>> {
        let prefix_len = 1 + name.len();
        let path = req.uri().path();
        let stripped = match &path[prefix_len..] {
            "" => "/",
            rest => rest,
        };
        let path_and_query = match req.uri().query() {
            Some(q) => format!("{stripped}?{q}"),
            None => stripped.to_string(),
        };

        let uri: Uri = format!("http://{}:{}{}", target.host, target.port, path_and_query)
            .parse()
            .map_err(|e| Error::Internal(format!("building upstream uri: {e}")))?;

        // An upgrade request keeps its OnUpgrade handle so the client side
        // can be bridged once the upstream answers 101.
        let client_upgrade = req
            .headers()
            .contains_key(header::UPGRADE)
            .then(|| hyper::upgrade::on(&mut req));

        *req.uri_mut() = uri;
        // Let the client fill Host from the upstream authority.
        req.headers_mut().remove(header::HOST);

        let mut resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Unavailable(format!("upstream request failed: {e}")))?;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut resp);
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client_io, upstream_io)) => {
                            let mut client_io = TokioIo::new(client_io);
                            let mut upstream_io = TokioIo::new(upstream_io);
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io)
                                    .await
                            {
                                debug!(error = %e, "upgraded connection closed");
                            }
                        }
                        Err(e) => warn!(error = %e, "upgrade bridging failed"),
                    }
                });
            }
        }

        Ok(resp.map(Body::new))
    }
}

fn spawn_serve(router: Arc<Router>, listener: tokio::net::TcpListener) {
    let mut stop_rx = router.stop_tx.subscribe();
    let app = AxumRouter::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(router);
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = stop_rx.wait_for(|stopped| *stopped).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "ingress server exited with error");
        }
    });
}

/// Single entry point for every ingress request: directory page, proxy, or
/// 404.
async fn dispatch(State(router): State<Arc<Router>>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();

    if path == "/" {
        return (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            router.directory_page(),
        )
            .into_response();
    }

    let name = path[1..].split('/').next().unwrap_or_default().to_string();
    let target = router.routes().get(&name).cloned();

    match target {
        Some(target) => match router.proxy(req, &name, &target).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(puck = %name, error = %e, "proxying failed");
                (StatusCode::BAD_GATEWAY, format!("{e}\n")).into_response()
            }
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn test_router() -> Arc<Router> {
        Router::new(RouterConfig {
            port: 0,
            ..Default::default()
        })
    }

    /// Serve a stub upstream that echoes the request path and query.
    async fn spawn_upstream() -> u16 {
        let app = AxumRouter::new()
            .route("/ping", get(|| async { "pong" }))
            .fallback(|req: Request<Body>| async move {
                format!(
                    "echo {}{}",
                    req.uri().path(),
                    req.uri()
                        .query()
                        .map(|q| format!("?{q}"))
                        .unwrap_or_default()
                )
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let router = test_router();
        router.add_route("web", "127.0.0.1", 9000);
        router.add_route("web", "127.0.0.1", 9000);
        assert_eq!(router.routes().len(), 1);

        router.add_route("web", "127.0.0.1", 9001);
        assert_eq!(
            router.routes().get("web"),
            Some(&RouteTarget {
                host: "127.0.0.1".into(),
                port: 9001
            })
        );

        router.remove_route("web");
        router.remove_route("web");
        assert!(router.routes().is_empty());
    }

    #[test]
    fn snapshots_are_immutable() {
        let router = test_router();
        router.add_route("a", "127.0.0.1", 9000);
        let before = router.routes();
        router.add_route("b", "127.0.0.1", 9001);

        assert_eq!(before.len(), 1, "published snapshot must not change");
        assert_eq!(router.routes().len(), 2);
    }

    #[test]
    fn directory_page_lists_routes() {
        let router = test_router();
        assert!(router.directory_page().starts_with("No pucks found"));

        router.add_route("web", "127.0.0.1", 9000);
        router.add_route("api", "127.0.0.1", 9001);
        let page = router.directory_page();
        assert!(page.starts_with("Available pucks:\n"));
        assert!(page.contains("  /web\n"));
        assert!(page.contains("  /api\n"));
    }

    #[tokio::test]
    async fn proxies_with_prefix_stripping() {
        let upstream_port = spawn_upstream().await;
        let router = test_router();
        let port = router.clone().start().await.unwrap().port();
        router.add_route("web", "127.0.0.1", upstream_port);

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://127.0.0.1:{port}/web/ping"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");

        // Query strings survive the rewrite.
        let body = client
            .get(format!("http://127.0.0.1:{port}/web/search?q=hello"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "echo /search?q=hello");

        // A bare /name forwards as the upstream root.
        let body = client
            .get(format!("http://127.0.0.1:{port}/web"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "echo /");

        router.stop();
    }

    #[tokio::test]
    async fn unknown_prefix_is_404_and_root_lists() {
        let router = test_router();
        let port = router.clone().start().await.unwrap().port();
        router.add_route("web", "127.0.0.1", 9000);

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://127.0.0.1:{port}/nope/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let body = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("  /web"));

        router.stop();
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let router = test_router();
        let port = router.clone().start().await.unwrap().port();
        // Nothing listens on this port.
        router.add_route("dead", "127.0.0.1", 1);

        let resp = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/dead/x"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);

        router.stop();
    }
}
