// Re-export dependencies used in public interfaces of common types

use std::fmt;
use std::path::PathBuf;

pub use chrono;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy produced by the daemon core. Categories are propagated
/// unchanged all the way to socket clients; the human message carries the
/// underlying cause.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Current state of a puck. Transitions happen only through the lifecycle
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Running,
    Stopped,
    Checkpointed,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Checkpointed => "checkpointed",
            Status::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Status {
        match s {
            "creating" => Status::Creating,
            "running" => Status::Running,
            "stopped" => Status::Stopped,
            "checkpointed" => Status::Checkpointed,
            _ => Status::Error,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistent container managed by the daemon. The `name` is the logical
/// identity; `id` is the runtime-assigned container id and changes when a
/// snapshot is restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Puck {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: Status,
    pub volume_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Auto-assigned host port the router forwards to.
    #[serde(default)]
    pub host_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_ip: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A checkpoint of a puck's state: the archive on disk plus its record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub puck_id: String,
    pub puck_name: String,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_lowercase() {
        for status in [
            Status::Creating,
            Status::Running,
            Status::Stopped,
            Status::Checkpointed,
            Status::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            assert_eq!(Status::parse(status.as_str()), status);
        }
    }

    #[test]
    fn puck_serialization_skips_empty_optionals() {
        let now = Utc::now();
        let p = Puck {
            id: "abc123".into(),
            name: "web".into(),
            image: "fedora:latest".into(),
            status: Status::Running,
            volume_dir: PathBuf::from("/data/pucks/web"),
            ports: vec![],
            host_port: 9000,
            container_ip: String::new(),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"host_port\":9000"));
        assert!(!json.contains("container_ip"));
        assert!(!json.contains("\"ports\""));
    }

    #[test]
    fn error_messages_name_the_category() {
        assert_eq!(
            Error::NotFound("puck 'web'".into()).to_string(),
            "puck 'web' not found"
        );
        assert!(Error::Exhausted("ports".into())
            .to_string()
            .contains("exhausted"));
    }
}
