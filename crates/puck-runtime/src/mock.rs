//! In-memory runtime for lifecycle tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use puck_common::{Error, Result};

use crate::{
    CheckpointOpts, ContainerRuntime, ContainerState, CreateContainerOpts, ExecOpts, RestoreOpts,
};

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    running: bool,
}

#[derive(Default)]
struct State {
    /// Keyed by container name; the id is also accepted as a reference.
    containers: HashMap<String, MockContainer>,
    calls: Vec<&'static str>,
}

/// Test double for the runtime capability set. Containers live in a map,
/// every call is recorded, and individual operations can be made to fail.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<State>,
    next_id: AtomicU64,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_checkpoint: AtomicBool,
    pub fail_restore: AtomicBool,
    /// Names for which remove_container fails, in addition to `fail_remove`.
    pub fail_remove_refs: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: &'static str) {
        self.state.lock().unwrap().calls.push(call);
    }

    pub fn was_called(&self, call: &str) -> bool {
        self.state.lock().unwrap().calls.iter().any(|c| *c == call)
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Force a container's running flag, regardless of lifecycle history.
    pub fn set_running(&self, reference: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        for c in state.containers.values_mut() {
            if c.id == reference {
                c.running = running;
                return;
            }
        }
        if let Some(c) = state.containers.get_mut(reference) {
            c.running = running;
        }
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    fn find(&self, reference: &str) -> Option<MockContainer> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(reference)
            .or_else(|| state.containers.values().find(|c| c.id == reference))
            .cloned()
    }

    fn new_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("mock-container-{n}")
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, _image: &str) -> Result<()> {
        self.record("ensure_image");
        Ok(())
    }

    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        self.record("create_container");
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Internal("mock create failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&opts.name) {
            return Err(Error::AlreadyExists(format!("container {}", opts.name)));
        }
        let id = self.new_id();
        state.containers.insert(
            opts.name.clone(),
            MockContainer {
                id: id.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, reference: &str) -> Result<()> {
        self.record("start_container");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Internal("mock start failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let found = state
            .containers
            .values_mut()
            .find(|c| c.id == reference)
            .map(|c| c.running = true)
            .is_some();
        if found {
            return Ok(());
        }
        match state.containers.get_mut(reference) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!("container {reference}"))),
        }
    }

    async fn stop_container(&self, reference: &str) -> Result<()> {
        self.record("stop_container");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Internal("mock stop failure".into()));
        }
        self.set_running(reference, false);
        Ok(())
    }

    async fn remove_container(&self, reference: &str, _force: bool) -> Result<()> {
        self.record("remove_container");
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::Internal("mock remove failure".into()));
        }
        {
            let refs = self.fail_remove_refs.lock().unwrap();
            if refs.iter().any(|r| r == reference) {
                return Err(Error::Internal(format!("mock remove failure for {reference}")));
            }
        }
        let mut state = self.state.lock().unwrap();
        let name = state
            .containers
            .iter()
            .find(|(name, c)| *name == reference || c.id == reference)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => {
                state.containers.remove(&name);
                Ok(())
            }
            None => Err(Error::NotFound(format!("container {reference}"))),
        }
    }

    async fn inspect(&self, reference: &str) -> Result<ContainerState> {
        self.record("inspect");
        match self.find(reference) {
            Some(c) => Ok(ContainerState {
                running: c.running,
                ip: Some("10.88.0.2".to_string()),
            }),
            None => Err(Error::NotFound(format!("container {reference}"))),
        }
    }

    async fn checkpoint(&self, reference: &str, opts: CheckpointOpts) -> Result<()> {
        self.record("checkpoint");
        if self.fail_checkpoint.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("mock checkpoint failure".into()));
        }
        if self.find(reference).is_none() {
            return Err(Error::NotFound(format!("container {reference}")));
        }
        std::fs::write(&opts.export_path, b"mock-checkpoint-data")?;
        if !opts.leave_running {
            self.set_running(reference, false);
        }
        Ok(())
    }

    async fn restore(&self, opts: RestoreOpts) -> Result<String> {
        self.record("restore");
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("mock restore failure".into()));
        }
        if !opts.import_path.exists() {
            return Err(Error::NotFound(format!(
                "archive {}",
                opts.import_path.display()
            )));
        }
        let id = self.new_id();
        self.state.lock().unwrap().containers.insert(
            opts.name.clone(),
            MockContainer {
                id: id.clone(),
                running: true,
            },
        );
        Ok(id)
    }

    async fn exec(&self, reference: &str, _opts: ExecOpts) -> Result<i32> {
        self.record("exec");
        if self.find(reference).is_none() {
            return Err(Error::NotFound(format!("container {reference}")));
        }
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_stop_remove_cycle() {
        let rt = MockRuntime::new();
        let id = rt
            .create_container(CreateContainerOpts {
                name: "a".into(),
                image: "fedora:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!rt.is_running(&id).await.unwrap());
        rt.start_container(&id).await.unwrap();
        assert!(rt.is_running(&id).await.unwrap());
        rt.stop_container(&id).await.unwrap();
        assert!(!rt.is_running(&id).await.unwrap());
        rt.remove_container(&id, false).await.unwrap();
        assert!(!rt.container_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let rt = MockRuntime::new();
        let opts = CreateContainerOpts {
            name: "dup".into(),
            image: "fedora:latest".into(),
            ..Default::default()
        };
        rt.create_container(opts.clone()).await.unwrap();
        let err = rt.create_container(opts).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn restore_assigns_a_fresh_id() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("snap.tar.gz");

        let rt = MockRuntime::new();
        let first = rt
            .create_container(CreateContainerOpts {
                name: "r".into(),
                image: "fedora:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        rt.start_container(&first).await.unwrap();
        rt.checkpoint(
            &first,
            CheckpointOpts {
                export_path: archive.clone(),
                leave_running: false,
            },
        )
        .await
        .unwrap();
        rt.remove_container(&first, true).await.unwrap();

        let second = rt
            .restore(RestoreOpts {
                import_path: archive,
                name: "r".into(),
            })
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(rt.is_running(&second).await.unwrap());
    }
}
