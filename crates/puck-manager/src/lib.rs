//! Lifecycle manager: sequences a runtime mutation, a filesystem mutation
//! and a store write into operations that look atomic from the outside.
//! Every failure path here either bubbles the categorized error up untouched
//! or rolls the partial work back first.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use puck_common::{Error, Puck, Result, Snapshot, Status};
use puck_runtime::{BindMount, CheckpointOpts, ContainerRuntime, CreateContainerOpts, RestoreOpts};
use puck_store::Store;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// First auto-assigned routing port.
pub const BASE_HOST_PORT: u16 = 9000;
/// Number of routing ports available; the range is [BASE, BASE + RANGE).
pub const HOST_PORT_RANGE: u16 = 1000;

/// Options accepted by [`Manager::create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOpts {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateOpts {
    pub puck_name: String,
    pub snapshot_name: String,
    #[serde(default)]
    pub leave_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRestoreOpts {
    pub puck_name: String,
    pub snapshot_name: String,
}

/// Outcome of [`Manager::destroy_all`]: the names that went away plus a
/// "name: cause" line per failure.
#[derive(Debug, Default)]
pub struct DestroyAllOutcome {
    pub destroyed: Vec<String>,
    pub failures: Vec<String>,
}

/// Data-directory layout and defaults the manager needs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_image: String,
    pub pucks_dir: PathBuf,
    pub snapshots_dir: PathBuf,
}

pub struct Manager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    cfg: ManagerConfig,
}

impl Manager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<Store>, cfg: ManagerConfig) -> Self {
        Self {
            runtime,
            store,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[instrument(skip(self, opts), fields(name = %opts.name))]
    pub async fn create(&self, opts: CreateOpts) -> Result<Puck> {
        if opts.name.is_empty() {
            return Err(Error::Precondition("puck name must not be empty".into()));
        }
        // Fail before touching the filesystem so a losing Create never
        // clobbers the winner's persistence tree.
        if self.store.get_puck(&opts.name).await.is_ok() {
            return Err(Error::AlreadyExists(format!("puck '{}'", opts.name)));
        }

        let image = if opts.image.is_empty() {
            self.cfg.default_image.clone()
        } else {
            opts.image.clone()
        };

        let host_port = self.allocate_host_port().await?;
        let volume_dir = self.cfg.pucks_dir.join(&opts.name);

        for subdir in ["home", "etc", "var"] {
            let path = volume_dir.join(subdir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| Error::Internal(format!("creating volume directory {subdir}: {e}")))?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| Error::Internal(format!("setting volume permissions: {e}")))?;
        }

        let binds = vec![
            BindMount {
                source: volume_dir.join("home"),
                target: "/home".into(),
            },
            BindMount {
                source: volume_dir.join("etc"),
                target: "/etc/puck".into(),
            },
            BindMount {
                source: volume_dir.join("var"),
                target: "/var/puck".into(),
            },
        ];

        let mut port_mappings = opts.ports.clone();
        port_mappings.push(format!("{host_port}:80"));

        let container_id = match self
            .runtime
            .create_container(CreateContainerOpts {
                name: opts.name.clone(),
                image: image.clone(),
                binds,
                ports: port_mappings,
                labels: vec![("puck.name".to_string(), opts.name.clone())],
                init: true,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.remove_volume_dir(&volume_dir).await;
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.start_container(&container_id).await {
            let _ = self.runtime.remove_container(&container_id, true).await;
            self.remove_volume_dir(&volume_dir).await;
            return Err(e);
        }

        // Missing IP is not fatal; some network modes report none.
        let container_ip = self
            .runtime
            .container_ip(&container_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();

        let now = Utc::now();
        let puck = Puck {
            id: container_id.clone(),
            name: opts.name.clone(),
            image,
            status: Status::Running,
            volume_dir: volume_dir.clone(),
            ports: opts.ports,
            host_port,
            container_ip,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.create_puck(&puck).await {
            let _ = self.runtime.remove_container(&container_id, true).await;
            self.remove_volume_dir(&volume_dir).await;
            return Err(match e {
                Error::AlreadyExists(msg) => Error::AlreadyExists(msg),
                other => Error::Internal(format!("saving puck: {other}")),
            });
        }

        info!(name = %puck.name, id = %puck.id, port = puck.host_port, "puck created");
        Ok(puck)
    }

    pub async fn get(&self, name: &str) -> Result<Puck> {
        self.store.get_puck(name).await
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.store.get_puck(name).await.is_ok()
    }

    /// All pucks, newest first, with running/stopped refreshed from the
    /// runtime. Inspect failures leave the stored status in place, which
    /// keeps `checkpointed` for containers that no longer exist.
    pub async fn list(&self) -> Result<Vec<Puck>> {
        let mut pucks = self.store.list_pucks().await?;
        for p in &mut pucks {
            match self.runtime.is_running(&p.id).await {
                Ok(true) => p.status = Status::Running,
                Ok(false) => p.status = Status::Stopped,
                Err(_) => {}
            }
        }
        Ok(pucks)
    }

    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<()> {
        let puck = self.store.get_puck(name).await?;
        self.runtime.start_container(&puck.id).await?;

        if let Ok(Some(ip)) = self.runtime.container_ip(&puck.id).await {
            let _ = self.store.update_container_ip(name, &ip).await;
        }
        self.store.update_status(name, Status::Running).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let puck = self.store.get_puck(name).await?;
        self.runtime.stop_container(&puck.id).await?;
        self.store.update_status(name, Status::Stopped).await
    }

    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str, force: bool) -> Result<()> {
        let puck = self.store.get_puck(name).await?;

        if !force {
            let running = self.runtime.is_running(&puck.id).await.unwrap_or(false);
            if running {
                self.runtime.stop_container(&puck.id).await.map_err(|e| {
                    Error::Precondition(format!(
                        "stopping container: {e} (use force to override)"
                    ))
                })?;
            }
        }

        match self.runtime.remove_container(&puck.id, force).await {
            Ok(()) => {}
            // Already gone; keep tearing the rest down.
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // A stale tree must not block the store deletion.
        self.remove_volume_dir(&puck.volume_dir).await;
        self.remove_volume_dir(&self.cfg.snapshots_dir.join(name)).await;

        self.store.delete_puck(name).await?;
        info!(name, "puck destroyed");
        Ok(())
    }

    pub async fn destroy_all(&self, force: bool) -> Result<DestroyAllOutcome> {
        let pucks = self.store.list_pucks().await?;

        let mut outcome = DestroyAllOutcome::default();
        for p in pucks {
            match self.destroy(&p.name, force).await {
                Ok(()) => outcome.destroyed.push(p.name),
                Err(e) => outcome.failures.push(format!("{}: {e}", p.name)),
            }
        }
        Ok(outcome)
    }

    /// Open an interactive shell, starting the puck first if needed.
    pub async fn console(&self, name: &str, shell: &str) -> Result<i32> {
        let puck = self.store.get_puck(name).await?;

        let running = self.runtime.is_running(&puck.id).await?;
        if !running {
            self.start(name).await?;
        }
        self.runtime.console(&puck.id, shell).await
    }

    #[instrument(skip(self, opts), fields(puck = %opts.puck_name, snapshot = %opts.snapshot_name))]
    pub async fn snapshot_create(&self, opts: SnapshotCreateOpts) -> Result<Snapshot> {
        let puck = self.store.get_puck(&opts.puck_name).await?;

        let running = self.runtime.is_running(&puck.id).await.unwrap_or(false);
        if !running {
            return Err(Error::Precondition(
                "puck must be running to create a snapshot".into(),
            ));
        }

        let snapshot_dir = self.cfg.snapshots_dir.join(&opts.puck_name);
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| Error::Internal(format!("creating snapshot directory: {e}")))?;

        let export_path = snapshot_dir.join(format!("{}.tar.gz", opts.snapshot_name));
        self.runtime
            .checkpoint(
                &puck.id,
                CheckpointOpts {
                    export_path: export_path.clone(),
                    leave_running: opts.leave_running,
                },
            )
            .await?;

        let size_bytes = match tokio::fs::metadata(&export_path).await {
            Ok(meta) => meta.len() as i64,
            Err(e) => {
                let _ = tokio::fs::remove_file(&export_path).await;
                return Err(Error::Internal(format!("reading snapshot size: {e}")));
            }
        };

        if !opts.leave_running {
            if let Err(e) = self
                .store
                .update_status(&opts.puck_name, Status::Checkpointed)
                .await
            {
                warn!(puck = %opts.puck_name, error = %e, "failed to mark puck checkpointed");
            }
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            puck_id: puck.id,
            puck_name: puck.name,
            name: opts.snapshot_name,
            path: export_path.clone(),
            size_bytes,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.create_snapshot(&snapshot).await {
            let _ = tokio::fs::remove_file(&export_path).await;
            return Err(match e {
                Error::AlreadyExists(msg) => Error::AlreadyExists(msg),
                other => Error::Internal(format!("saving snapshot: {other}")),
            });
        }

        info!(snapshot = %snapshot.name, bytes = snapshot.size_bytes, "snapshot created");
        Ok(snapshot)
    }

    /// Replace the puck's container with one restored from the archive.
    /// This is the only path that changes a puck's runtime id.
    #[instrument(skip(self, opts), fields(puck = %opts.puck_name, snapshot = %opts.snapshot_name))]
    pub async fn snapshot_restore(&self, opts: SnapshotRestoreOpts) -> Result<Puck> {
        let puck = self.store.get_puck(&opts.puck_name).await?;
        let snapshot = self
            .store
            .get_snapshot(&puck.id, &opts.snapshot_name)
            .await?;

        if !snapshot.path.exists() {
            return Err(Error::NotFound(format!(
                "snapshot file {}",
                snapshot.path.display()
            )));
        }

        if self.runtime.is_running(&puck.id).await.unwrap_or(false) {
            self.runtime.stop_container(&puck.id).await?;
        }

        // The old container may already be gone; restore recreates it.
        if let Err(e) = self.runtime.remove_container(&puck.id, true).await {
            if !matches!(e, Error::NotFound(_)) {
                warn!(error = %e, "removing container before restore");
            }
        }

        let new_id = self
            .runtime
            .restore(RestoreOpts {
                import_path: snapshot.path.clone(),
                name: opts.puck_name.clone(),
            })
            .await?;

        let ip = self.runtime.container_ip(&new_id).await.ok().flatten();
        self.store.update_runtime_id(&puck.id, &new_id, ip).await?;

        info!(old_id = %puck.id, %new_id, "puck restored from snapshot");
        self.store.get_puck(&opts.puck_name).await
    }

    pub async fn snapshot_list(&self, puck_name: &str) -> Result<Vec<Snapshot>> {
        let puck = self.store.get_puck(puck_name).await?;
        self.store.list_snapshots(&puck.id).await
    }

    pub async fn snapshot_delete(&self, puck_name: &str, snapshot_name: &str) -> Result<()> {
        let puck = self.store.get_puck(puck_name).await?;
        let snapshot = self.store.get_snapshot(&puck.id, snapshot_name).await?;

        if let Err(e) = tokio::fs::remove_file(&snapshot.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::Internal(format!("removing snapshot file: {e}")));
            }
        }
        self.store.delete_snapshot(&snapshot.id).await
    }

    async fn allocate_host_port(&self) -> Result<u16> {
        let pucks = self.store.list_pucks().await?;
        let used: HashSet<u16> = pucks
            .iter()
            .filter(|p| p.host_port > 0)
            .map(|p| p.host_port)
            .collect();
        lowest_free_port(&used)
    }

    async fn remove_volume_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to remove volume directory");
            }
        }
    }
}

/// Lowest unused port in [BASE_HOST_PORT, BASE_HOST_PORT + HOST_PORT_RANGE).
fn lowest_free_port(used: &HashSet<u16>) -> Result<u16> {
    (BASE_HOST_PORT..BASE_HOST_PORT + HOST_PORT_RANGE)
        .find(|port| !used.contains(port))
        .ok_or_else(|| {
            Error::Exhausted(format!(
                "no routing ports left in {}-{}",
                BASE_HOST_PORT,
                BASE_HOST_PORT + HOST_PORT_RANGE - 1
            ))
        })
}
