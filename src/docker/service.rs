use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageInspect};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use tracing::{debug, error, info};

use crate::error::{is_docker_not_found, DaemonError, Result};

/// Label marking containers managed by this daemon.
pub const MANAGED_LABEL: &str = "io.workbench.managed";

/// Label carrying the daemon-side container id.
pub const CONTAINER_ID_LABEL: &str = "io.workbench.container-id";

/// Label carrying the optional alias.
pub const ALIAS_LABEL: &str = "io.workbench.alias";

/// The bounded workspace directory inside every container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Live output stream of a demultiplexed exec.
pub type ExecStream = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Collected output of an exec run to completion.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Thin adapter over the Docker engine API.
///
/// Every method maps one engine call; the managers own all policy. 404
/// responses are surfaced through [`is_docker_not_found`] so callers can
/// apply their own missing-object rules.
#[derive(Clone)]
pub struct DockerService {
    client: Arc<Docker>,
}

impl DockerService {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults().map_err(DaemonError::Docker)?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(DaemonError::Docker)?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(DaemonError::Docker)?;
        Ok(())
    }

    pub async fn version(&self) -> Result<String> {
        let version = self.client.version().await.map_err(DaemonError::Docker)?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Create a container and return the engine-assigned id.
    pub async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(DaemonError::Docker)?;

        debug!("Created container {} ({})", name, response.id);
        Ok(response.id)
    }

    pub async fn start_container(&self, docker_id: &str) -> Result<()> {
        self.client
            .start_container::<String>(docker_id, None)
            .await
            .map_err(DaemonError::Docker)?;
        Ok(())
    }

    pub async fn stop_container(&self, docker_id: &str, timeout_s: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_s };
        self.client
            .stop_container(docker_id, Some(options))
            .await
            .map_err(DaemonError::Docker)?;
        Ok(())
    }

    pub async fn remove_container(
        &self,
        docker_id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        self.client
            .remove_container(docker_id, Some(options))
            .await
            .map_err(DaemonError::Docker)?;
        Ok(())
    }

    pub async fn inspect_container(&self, docker_id: &str) -> Result<ContainerInspectResponse> {
        self.client
            .inspect_container(docker_id, None)
            .await
            .map_err(DaemonError::Docker)
    }

    /// Engine-side status string ("running", "exited", ...) or None if the
    /// container no longer exists.
    pub async fn container_status(&self, docker_id: &str) -> Result<Option<String>> {
        match self.client.inspect_container(docker_id, None).await {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.status)
                .map(|s| s.to_string())),
            Err(e) if is_docker_not_found(&e) => Ok(None),
            Err(e) => Err(DaemonError::Docker(e)),
        }
    }

    /// List every container (running or not) carrying the managed label.
    pub async fn list_managed_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        self.client
            .list_containers(Some(options))
            .await
            .map_err(DaemonError::Docker)
    }

    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        let options = RemoveVolumeOptions { force: false };
        self.client
            .remove_volume(name, Some(options))
            .await
            .map_err(DaemonError::Docker)?;
        Ok(())
    }

    pub async fn inspect_image(&self, image: &str) -> Result<ImageInspect> {
        self.client
            .inspect_image(image)
            .await
            .map_err(DaemonError::Docker)
    }

    /// Pull an image, draining the progress stream.
    pub async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull {}: {}", image, status);
                    }
                }
                Err(e) => {
                    error!("Failed to pull image {}: {}", image, e);
                    return Err(DaemonError::Docker(e));
                }
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    /// Upload a tar archive, extracting it at `path` inside the container.
    pub async fn upload_archive(&self, docker_id: &str, path: &str, tar: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(docker_id, Some(options), tar)
            .await
            .map_err(DaemonError::Docker)?;
        Ok(())
    }

    /// Download `path` from the container as a tar archive stream.
    pub fn download_archive(
        &self,
        docker_id: &str,
        path: &str,
    ) -> impl Stream<Item = std::result::Result<Bytes, bollard::errors::Error>> + '_ {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        self.client.download_from_container(docker_id, Some(options))
    }

    /// Start a demultiplexed exec and return its id plus the live output
    /// stream. The caller polls [`Self::exec_exit_code`] once the stream
    /// ends.
    pub async fn exec_stream(
        &self,
        docker_id: &str,
        cmd: Vec<String>,
        cwd: &str,
        env: Option<&HashMap<String, String>>,
        user: &str,
    ) -> Result<(String, ExecStream)> {
        let env_vars: Option<Vec<String>> =
            env.map(|e| e.iter().map(|(k, v)| format!("{}={}", k, v)).collect());

        let exec = self
            .client
            .create_exec(
                docker_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(cwd.to_string()),
                    env: env_vars,
                    user: Some(user.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(DaemonError::Docker)?;

        let started = self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(DaemonError::Docker)?;

        match started {
            StartExecResults::Attached { output, .. } => Ok((exec.id, output)),
            StartExecResults::Detached => Err(DaemonError::Internal(
                "exec unexpectedly started detached".to_string(),
            )),
        }
    }

    /// Exit code of a finished exec, if the engine has recorded one.
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(DaemonError::Docker)?;
        Ok(inspect.exit_code)
    }

    /// Run a command to completion and collect demultiplexed output.
    ///
    /// Convenience used by filesystem operations and health checks, where
    /// output is small and bounded.
    pub async fn exec_collect(
        &self,
        docker_id: &str,
        cmd: Vec<String>,
        cwd: &str,
        env: Option<&HashMap<String, String>>,
        user: &str,
    ) -> Result<ExecOutput> {
        let (exec_id, mut stream) = self.exec_stream(docker_id, cmd, cwd, env, user).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk.map_err(DaemonError::Docker)? {
                LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::Console { message } => stdout.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        let exit_code = self.exec_exit_code(&exec_id).await?.unwrap_or(-1);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
