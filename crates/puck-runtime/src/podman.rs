use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::TryStreamExt;
use puck_common::{Error, Result};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, instrument, warn};

use crate::{
    CheckpointOpts, ContainerRuntime, ContainerState, CreateContainerOpts, ExecOpts, RestoreOpts,
};

/// Grace timeout passed to container stop, in seconds.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Container runtime backed by Podman. Lifecycle calls go through the
/// Docker-compatible API on Podman's Unix socket; checkpoint/restore and
/// interactive exec shell out to the `podman` binary, which is the only
/// surface that exposes CRIU and a real TTY.
pub struct PodmanRuntime {
    docker: Docker,
    podman_bin: String,
}

/// Locate the Podman API socket: rootless under `/run/user/<uid>/`, rootful
/// at `/run/podman/podman.sock`.
pub fn detect_podman_socket() -> Option<PathBuf> {
    let uid = nix::unistd::Uid::current();
    if !uid.is_root() {
        let sock = PathBuf::from(format!("/run/user/{uid}/podman/podman.sock"));
        if sock.exists() {
            return Some(sock);
        }
    }
    let sock = PathBuf::from("/run/podman/podman.sock");
    sock.exists().then_some(sock)
}

impl PodmanRuntime {
    /// Connect to the Podman socket. `socket` overrides auto-detection.
    pub fn connect(socket: Option<&Path>) -> Result<Self> {
        let path = match socket {
            Some(p) => p.to_path_buf(),
            None => detect_podman_socket().ok_or_else(|| {
                Error::Unavailable("no podman socket found (is podman.socket enabled?)".into())
            })?,
        };
        let docker = Docker::connect_with_socket(
            &path.to_string_lossy(),
            120,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| Error::Unavailable(format!("connecting to podman at {}: {e}", path.display())))?;
        info!(socket = %path.display(), "connected to podman");
        Ok(Self {
            docker,
            podman_bin: "podman".to_string(),
        })
    }

    fn cli(&self) -> AsyncCommand {
        AsyncCommand::new(&self.podman_bin)
    }
}

/// Map an API error onto the failure taxonomy, keeping the runtime's
/// message intact.
fn categorize(err: BollardError) -> Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => Error::NotFound(message),
            409 => Error::AlreadyExists(message),
            500.. => Error::Internal(message),
            _ => Error::Transient(message),
        },
        BollardError::RequestTimeoutError => Error::Transient("runtime request timed out".into()),
        other => {
            let msg = other.to_string();
            if msg.contains("connection refused")
                || msg.contains("No such file or directory")
                || msg.contains("error trying to connect")
            {
                Error::Unavailable(msg)
            } else {
                Error::Internal(msg)
            }
        }
    }
}

/// Classify a failed `podman` CLI invocation from its stderr. A missing
/// CRIU installation is the common case and must surface as Unsupported.
fn categorize_cli(op: &str, stderr: &str) -> Error {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("criu") || lower.contains("checkpoint/restore") {
        Error::Unsupported(format!("{op}: {}", stderr.trim()))
    } else if lower.contains("no such container") || lower.contains("no container with name") {
        Error::NotFound(stderr.trim().to_string())
    } else {
        Error::Internal(format!("{op}: {}", stderr.trim()))
    }
}

fn parse_port_spec(spec: &str) -> Option<(String, String)> {
    let (host, container) = spec.split_once(':')?;
    host.parse::<u16>().ok()?;
    container.parse::<u16>().ok()?;
    Some((host.to_string(), container.to_string()))
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    #[instrument(skip(self))]
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(categorize(e)),
        }

        info!(%image, "pulling image");
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.try_next().await.map_err(categorize)? {
            if let Some(status) = progress.status {
                debug!(%image, %status, "pull progress");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, opts), fields(name = %opts.name, image = %opts.image))]
    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        self.ensure_image(&opts.image).await?;

        let binds: Vec<String> = opts
            .binds
            .iter()
            .map(|b| format!("{}:{}:rw", b.source.display(), b.target))
            .collect();

        let mut port_bindings: PortMap = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for spec in &opts.ports {
            let Some((host_port, container_port)) = parse_port_spec(spec) else {
                warn!(%spec, "skipping invalid port mapping");
                continue;
            };
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            let bindings = port_bindings.entry(key).or_insert_with(|| Some(Vec::new()));
            if let Some(bindings) = bindings {
                bindings.push(PortBinding {
                    host_ip: None,
                    host_port: Some(host_port),
                });
            }
        }

        let mut labels: HashMap<String, String> =
            HashMap::from([("managed-by".to_string(), "puck".to_string())]);
        labels.extend(opts.labels.iter().cloned());

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            init: Some(opts.init),
            ..Default::default()
        };

        let config = Config {
            image: Some(opts.image.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: opts.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(categorize)?;

        info!(id = %response.id, name = %opts.name, "container created");
        Ok(response.id)
    }

    async fn start_container(&self, reference: &str) -> Result<()> {
        self.docker
            .start_container(reference, None::<StartContainerOptions<String>>)
            .await
            .map_err(categorize)
    }

    async fn stop_container(&self, reference: &str) -> Result<()> {
        self.docker
            .stop_container(
                reference,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(categorize)
    }

    async fn remove_container(&self, reference: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                reference,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(categorize)
    }

    async fn inspect(&self, reference: &str) -> Result<ContainerState> {
        let data = self
            .docker
            .inspect_container(reference, None::<InspectContainerOptions>)
            .await
            .map_err(categorize)?;

        let running = data
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let ip = data
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|nets| {
                nets.values()
                    .find_map(|n| n.ip_address.clone().filter(|ip| !ip.is_empty()))
            });

        Ok(ContainerState { running, ip })
    }

    #[instrument(skip(self, opts), fields(export = %opts.export_path.display()))]
    async fn checkpoint(&self, reference: &str, opts: CheckpointOpts) -> Result<()> {
        let mut cmd = self.cli();
        cmd.args(["container", "checkpoint"])
            .arg("--export")
            .arg(&opts.export_path)
            .arg("--tcp-established");
        if opts.leave_running {
            cmd.arg("--leave-running");
        }
        cmd.arg(reference);

        debug!(?cmd, "running checkpoint");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Unavailable(format!("spawning podman: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(categorize_cli("checkpoint", &stderr));
        }
        info!(%reference, "checkpoint exported");
        Ok(())
    }

    #[instrument(skip(self, opts), fields(import = %opts.import_path.display(), name = %opts.name))]
    async fn restore(&self, opts: RestoreOpts) -> Result<String> {
        let mut cmd = self.cli();
        cmd.args(["container", "restore"])
            .arg("--import")
            .arg(&opts.import_path)
            .arg("--tcp-established");
        if !opts.name.is_empty() {
            cmd.arg("--name").arg(&opts.name);
        }

        debug!(?cmd, "running restore");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Unavailable(format!("spawning podman: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(categorize_cli("restore", &stderr));
        }

        // podman prints the restored container id on stdout.
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(Error::Internal(
                "restore produced no container id".to_string(),
            ));
        }
        info!(%id, "container restored");
        Ok(id)
    }

    async fn exec(&self, reference: &str, opts: ExecOpts) -> Result<i32> {
        let mut cmd = self.cli();
        cmd.arg("exec");
        if opts.interactive {
            cmd.arg("-i");
        }
        if opts.tty {
            cmd.arg("-t");
        }
        if let Some(workdir) = &opts.workdir {
            cmd.arg("-w").arg(workdir);
        }
        if let Some(user) = &opts.user {
            cmd.arg("-u").arg(user);
        }
        for env in &opts.env {
            cmd.arg("-e").arg(env);
        }
        cmd.arg(reference).args(&opts.cmd);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = cmd
            .status()
            .await
            .map_err(|e| Error::Unavailable(format!("spawning podman: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(categorize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_parsing() {
        assert_eq!(
            parse_port_spec("9000:80"),
            Some(("9000".to_string(), "80".to_string()))
        );
        assert_eq!(parse_port_spec("9000"), None);
        assert_eq!(parse_port_spec("abc:80"), None);
        assert_eq!(parse_port_spec("9000:http"), None);
    }

    #[test]
    fn cli_failures_are_categorized() {
        let err = categorize_cli("checkpoint", "criu binary not found in $PATH");
        assert!(matches!(err, Error::Unsupported(_)));

        let err = categorize_cli("checkpoint", "Error: no such container foo");
        assert!(matches!(err, Error::NotFound(_)));

        let err = categorize_cli("restore", "something else went wrong");
        assert!(matches!(err, Error::Internal(_)));
    }
}
