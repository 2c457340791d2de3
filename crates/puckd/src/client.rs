//! Free-standing client for the control socket. Lives in its own process
//! (the CLI links it); only the wire protocol is shared with the daemon.

use std::path::PathBuf;
use std::time::Duration;

use puck_common::{Puck, Snapshot};
use puck_manager::{CreateOpts, SnapshotCreateOpts, SnapshotRestoreOpts};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::protocol::{Request, Response};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connecting to daemon: {0} (is puckd running?)")]
    Connect(String),

    #[error("daemon request timed out")]
    Timeout,

    /// Failure reported by the daemon, verbatim.
    #[error("{0}")]
    Daemon(String),

    /// destroy-all tore some pucks down before failing.
    #[error("{message}")]
    PartialDestroy {
        destroyed: Vec<String>,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Send one request and read the daemon's reply. One connection per
    /// request; the server closes after responding.
    pub async fn raw(&self, request: &Request) -> Result<Response> {
        let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        timeout(REQUEST_TIMEOUT, exchange(stream, request))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn call<T: DeserializeOwned>(&self, action: &str, data: Option<&impl Serialize>) -> Result<T> {
        let response = self.request(action, data).await?;
        decode_data(response.data)
    }

    async fn request(&self, action: &str, data: Option<&impl Serialize>) -> Result<Response> {
        let data = match data {
            Some(value) => Some(
                serde_json::to_value(value)
                    .map_err(|e| ClientError::Protocol(format!("encoding request: {e}")))?,
            ),
            None => None,
        };
        let response = self
            .raw(&Request {
                action: action.to_string(),
                data,
            })
            .await?;
        if !response.success {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| "daemon reported failure".to_string());
            // destroy-all is the one action with meaningful partial results.
            if action == "destroy-all" {
                let destroyed = decode_data(response.data).unwrap_or_default();
                return Err(ClientError::PartialDestroy { destroyed, message });
            }
            return Err(ClientError::Daemon(message));
        }
        Ok(response)
    }

    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None::<&()>).await?;
        Ok(())
    }

    pub async fn create(&self, opts: CreateOpts) -> Result<Puck> {
        self.call("create", Some(&opts)).await
    }

    pub async fn list(&self) -> Result<Vec<Puck>> {
        self.call("list", None::<&()>).await
    }

    pub async fn get(&self, name: &str) -> Result<Puck> {
        self.call("get", Some(&serde_json::json!({ "name": name })))
            .await
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.request("start", Some(&serde_json::json!({ "name": name })))
            .await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.request("stop", Some(&serde_json::json!({ "name": name })))
            .await?;
        Ok(())
    }

    pub async fn destroy(&self, name: &str, force: bool) -> Result<()> {
        self.request(
            "destroy",
            Some(&serde_json::json!({ "name": name, "force": force })),
        )
        .await?;
        Ok(())
    }

    /// Names of the pucks that were destroyed. A partial failure surfaces
    /// as [`ClientError::PartialDestroy`] carrying the same list.
    pub async fn destroy_all(&self, force: bool) -> Result<Vec<String>> {
        self.call("destroy-all", Some(&serde_json::json!({ "force": force })))
            .await
    }

    pub async fn snapshot_create(
        &self,
        puck_name: &str,
        snapshot_name: &str,
        leave_running: bool,
    ) -> Result<Snapshot> {
        self.call(
            "snapshot-create",
            Some(&SnapshotCreateOpts {
                puck_name: puck_name.to_string(),
                snapshot_name: snapshot_name.to_string(),
                leave_running,
            }),
        )
        .await
    }

    pub async fn snapshot_restore(&self, puck_name: &str, snapshot_name: &str) -> Result<()> {
        self.request(
            "snapshot-restore",
            Some(&SnapshotRestoreOpts {
                puck_name: puck_name.to_string(),
                snapshot_name: snapshot_name.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn snapshot_list(&self, puck_name: &str) -> Result<Vec<Snapshot>> {
        self.call(
            "snapshot-list",
            Some(&serde_json::json!({ "puck_name": puck_name })),
        )
        .await
    }

    pub async fn snapshot_delete(&self, puck_name: &str, snapshot_name: &str) -> Result<()> {
        self.request(
            "snapshot-delete",
            Some(&serde_json::json!({
                "puck_name": puck_name,
                "snapshot_name": snapshot_name
            })),
        )
        .await?;
        Ok(())
    }
}

async fn exchange(mut stream: UnixStream, request: &Request) -> Result<Response> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| ClientError::Protocol(format!("encoding request: {e}")))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    stream
        .write_all(b"\n")
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    // The server writes one response and closes.
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    serde_json::from_slice(&buf).map_err(|e| ClientError::Protocol(format!("decoding response: {e}")))
}

fn decode_data<T: DeserializeOwned>(data: Option<serde_json::Value>) -> Result<T> {
    serde_json::from_value(data.unwrap_or(serde_json::Value::Null))
        .map_err(|e| ClientError::Protocol(format!("decoding response data: {e}")))
}
