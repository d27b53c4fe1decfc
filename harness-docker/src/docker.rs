//! [`ContainerBackend`] over the Docker Engine API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;

use harness_core::{
    BackendError, CommandOutput, ContainerBackend, ContainerHandle, ContainerSpec,
    OperationResult,
};

/// Lets agents reach ports bound on the host (the controller's service port).
const HOST_GATEWAY_ALIAS: &str = "host.docker.internal:host-gateway";

/// Provisions harness machines as local Docker containers.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime)?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn provision(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError> {
        let (exposed_ports, port_bindings) = port_maps(&spec.ports);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                privileged: Some(true),
                port_bindings: Some(port_bindings),
                extra_hosts: Some(vec![HOST_GATEWAY_ALIAS.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(runtime)?;
        for warning in &created.warnings {
            tracing::warn!("docker: {}", warning);
        }

        let handle = ContainerHandle::new(created.id, &spec.name);
        if let Err(e) = self
            .docker
            .start_container(handle.id(), None::<StartContainerOptions<String>>)
            .await
        {
            // Don't leak a created-but-never-started container
            if let Err(cleanup) = self.destroy(&handle).await {
                tracing::warn!(
                    "Failed to remove unstarted container {}: {}",
                    handle.name(),
                    cleanup
                );
            }
            return Err(runtime(e));
        }

        tracing::debug!("Started container {} ({})", handle.name(), handle.id());
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &ContainerHandle,
        command: &str,
    ) -> Result<OperationResult, BackendError> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(handle.id(), exec_options)
            .await
            .map_err(|e| exec_error(handle, e))?;

        let mut output = Vec::new();
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| exec_error(handle, e))?;
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(msg) = stream.next().await {
                match msg.map_err(|e| exec_error(handle, e))? {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => output.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| exec_error(handle, e))?;

        Ok(OperationResult {
            exit_status: inspect.exit_code,
            output: CommandOutput::from_bytes(output),
        })
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let archive = build_archive(path, contents)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(handle.id(), Some(options), archive.into())
            .await
            .map_err(|e| BackendError::Transfer {
                container: handle.name().to_string(),
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn fetch_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, BackendError> {
        let transfer_error = |reason: String| BackendError::Transfer {
            container: handle.name().to_string(),
            path: path.to_string(),
            reason,
        };

        let file_name = Path::new(path)
            .file_name()
            .ok_or_else(|| transfer_error("path has no file name".into()))?;

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = Box::pin(
            self.docker
                .download_from_container(handle.id(), Some(options)),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transfer_error(e.to_string()))?;
            archive.extend_from_slice(&chunk);
        }

        tar::Archive::new(archive.as_slice()).unpack(dest_dir)?;

        let local = dest_dir.join(file_name);
        if !local.exists() {
            return Err(transfer_error("archive did not contain the file".into()));
        }
        Ok(local)
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(handle.id(), Some(options)).await {
            Ok(()) => {
                tracing::debug!("Removed container {}", handle.name());
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                tracing::debug!("Container {} already removed", handle.name());
                Ok(())
            }
            Err(e) => Err(runtime(e)),
        }
    }
}

fn runtime(e: bollard::errors::Error) -> BackendError {
    BackendError::Runtime(Box::new(e))
}

fn exec_error(handle: &ContainerHandle, e: bollard::errors::Error) -> BackendError {
    if is_not_found(&e) {
        return BackendError::NotFound(handle.name().to_string());
    }
    BackendError::Exec {
        container: handle.name().to_string(),
        reason: e.to_string(),
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;
type PortBindings = HashMap<String, Option<Vec<PortBinding>>>;

/// Translate `container port -> host port` into Docker's two port maps.
fn port_maps(ports: &HashMap<String, String>) -> (ExposedPorts, PortBindings) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();

    for (service, host) in ports {
        let key = if service.contains('/') {
            service.clone()
        } else {
            format!("{}/tcp", service)
        };
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host.clone()),
            }]),
        );
    }

    (exposed, bindings)
}

/// Single-entry tar archive placing `contents` at absolute `path` when
/// extracted at `/`.
fn build_archive(path: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let relative = path.trim_start_matches('/');

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, relative, contents)?;
    builder.into_inner()
}
