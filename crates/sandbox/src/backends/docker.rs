//! Docker sandbox service using the `bollard` crate.
//!
//! Mapping onto the capability interface:
//!
//! - app namespace: a Docker network, created on first use
//! - session: a labelled container whose main process is `sleep`, which
//!   gives the session its timeout
//! - tunnels: requested ports published on ephemeral loopback ports
//! - exec: create/start/inspect exec, with the multiplexed output split into
//!   two independent pipes by a pump task
//! - files: single-entry tar archives through the container archive
//!   endpoints; absolute paths only

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use skiff_core::config::Credentials;
use skiff_core::{Error, ExecutionRequest, Result, RuntimeTag};

use crate::capability::{
    AppRef, FileHandle, OpenMode, OutputPipe, Process, SandboxService, Session,
    SessionDescriptor, SpawnSpec, Tunnel,
};

const MANAGED_BY: &str = "skiff";
const LABEL_MANAGED_BY: &str = "managed-by";
const LABEL_OWNER: &str = "owner";
const LABEL_RUNTIME: &str = "runtime";
const LABEL_APP: &str = "app";
const LABEL_TIMEOUT_MS: &str = "timeout-ms";
const LABEL_META_PREFIX: &str = "meta.";

const PIPE_CAPACITY: usize = 64 * 1024;

type LogStream = Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, BollardError>> + Send>>;

fn docker_failure(action: &str, err: BollardError) -> Error {
    Error::remote(format!("{}: {}", action, err))
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404)
}

// =============================================================================
// Service
// =============================================================================

/// Sandbox service backed by the local Docker daemon.
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            Error::remote(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| docker_failure("Failed to pull image", e))?;
        }
        Ok(())
    }

    fn session_from_inspect(&self, inspect: ContainerInspectResponse) -> Option<DockerSession> {
        let id = inspect.name.as_deref()?.trim_start_matches('/').to_string();
        let config = inspect.config?;
        let labels = config.labels.unwrap_or_default();

        let runtime = labels
            .get(LABEL_RUNTIME)
            .and_then(|r| r.parse::<RuntimeTag>().ok())
            .unwrap_or_default();
        let created_at = inspect
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let timeout = labels
            .get(LABEL_TIMEOUT_MS)
            .and_then(|t| t.parse().ok())
            .map(Duration::from_millis);
        let metadata = labels
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(LABEL_META_PREFIX)
                    .map(|k| (k.to_string(), v.clone()))
            })
            .collect();

        Some(DockerSession {
            docker: self.docker.clone(),
            descriptor: SessionDescriptor {
                id,
                app: labels.get(LABEL_APP).cloned().unwrap_or_default(),
                image: config.image.unwrap_or_default(),
                runtime,
                created_at,
                timeout,
                metadata,
            },
        })
    }
}

#[async_trait]
impl SandboxService for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    async fn lookup_app(
        &self,
        _credentials: &Credentials,
        name: &str,
        create_if_missing: bool,
    ) -> Result<AppRef> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) && create_if_missing => {
                let options = CreateNetworkOptions {
                    name,
                    driver: "bridge",
                    labels: HashMap::from([(LABEL_MANAGED_BY, MANAGED_BY)]),
                    ..Default::default()
                };
                self.docker
                    .create_network(options)
                    .await
                    .map_err(|e| docker_failure("Failed to create app network", e))?;
                tracing::info!(app = %name, "App network created");
            }
            Err(e) => return Err(docker_failure("Failed to look up app network", e)),
        }

        Ok(AppRef {
            id: name.to_string(),
            name: name.to_string(),
        })
    }

    async fn spawn(
        &self,
        credentials: &Credentials,
        app: &AppRef,
        spec: &SpawnSpec,
    ) -> Result<Arc<dyn Session>> {
        self.ensure_image(&spec.image).await?;

        let id = format!("skiff-{}", uuid::Uuid::new_v4());

        let mut labels = HashMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_OWNER.to_string(), credentials.token_id.clone()),
            (LABEL_RUNTIME.to_string(), spec.runtime.to_string()),
            (LABEL_APP.to_string(), app.name.clone()),
        ]);
        if let Some(timeout) = spec.timeout {
            labels.insert(LABEL_TIMEOUT_MS.to_string(), timeout.as_millis().to_string());
        }
        for (key, value) in &spec.metadata {
            labels.insert(format!("{}{}", LABEL_META_PREFIX, key), value.clone());
        }

        let sleep = match spec.timeout {
            Some(timeout) => timeout.as_secs().max(1).to_string(),
            None => "infinity".to_string(),
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();
        let port_bindings = spec
            .ports
            .iter()
            .map(|port| {
                (
                    format!("{}/tcp", port),
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".to_string()),
                        host_port: None,
                    }]),
                )
            })
            .collect();

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), sleep]),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                network_mode: Some(app.id.clone()),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: id.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| docker_failure("Failed to create sandbox container", e))?;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_failure("Failed to start sandbox container", e))?;

        tracing::info!(sandbox_id = %id, image = %spec.image, "Sandbox container started");

        Ok(Arc::new(DockerSession {
            docker: self.docker.clone(),
            descriptor: SessionDescriptor {
                id,
                app: app.name.clone(),
                image: spec.image.clone(),
                runtime: spec.runtime,
                created_at: Utc::now(),
                timeout: spec.timeout,
                metadata: spec.metadata.clone(),
            },
        }))
    }

    async fn lookup(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> Result<Option<Arc<dyn Session>>> {
        let inspect = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(docker_failure("Failed to look up sandbox", e)),
        };

        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref());
        let owned = labels.is_some_and(|labels| {
            labels.get(LABEL_MANAGED_BY).map(String::as_str) == Some(MANAGED_BY)
                && labels.get(LABEL_OWNER) == Some(&credentials.token_id)
        });
        if !owned {
            return Ok(None);
        }

        Ok(self
            .session_from_inspect(inspect)
            .map(|session| Arc::new(session) as Arc<dyn Session>))
    }

    async fn list(&self, credentials: &Credentials) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY),
                format!("{}={}", LABEL_OWNER, credentials.token_id),
            ],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_failure("Failed to list sandboxes", e))?;

        let mut ids: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

// =============================================================================
// Session
// =============================================================================

struct DockerSession {
    docker: Docker,
    descriptor: SessionDescriptor,
}

#[async_trait]
impl Session for DockerSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn exec(&self, request: &ExecutionRequest) -> Result<Box<dyn Process>> {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_options = CreateExecOptions {
            cmd: Some(request.argv.clone()),
            env: (!env.is_empty()).then_some(env),
            working_dir: request.cwd.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.descriptor.id, exec_options)
            .await
            .map_err(|e| docker_failure("Failed to create exec in sandbox", e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_failure("Failed to start exec in sandbox", e))?;

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);

        let pump = match started {
            StartExecResults::Attached { output, .. } => Some(tokio::spawn(pump_output(
                output,
                stdout_writer,
                stderr_writer,
            ))),
            StartExecResults::Detached => None,
        };

        Ok(Box::new(DockerProcess {
            docker: self.docker.clone(),
            exec_id: exec.id,
            stdout: Some(Box::pin(stdout_reader)),
            stderr: Some(Box::pin(stderr_reader)),
            pump,
        }))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        let (dir, name) = split_path(path).ok_or_else(|| {
            Error::remote(format!("archive access needs an absolute file path: {}", path))
        })?;

        let buffer = match mode {
            OpenMode::Read => {
                let mut stream = Box::pin(self.docker.download_from_container(
                    &self.descriptor.id,
                    Some(DownloadFromContainerOptions {
                        path: path.to_string(),
                    }),
                ));
                let mut archive = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| docker_failure("Failed to download file", e))?;
                    archive.extend_from_slice(&chunk);
                }
                unpack_file(&archive)?
            }
            OpenMode::Write => Vec::new(),
        };

        Ok(Box::new(DockerFile {
            docker: self.docker.clone(),
            container: self.descriptor.id.clone(),
            dir: dir.to_string(),
            name: name.to_string(),
            mode,
            buffer,
        }))
    }

    async fn tunnels(&self) -> Result<Vec<Tunnel>> {
        let inspect = self
            .docker
            .inspect_container(&self.descriptor.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_failure("Failed to inspect sandbox", e))?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        let mut tunnels: Vec<Tunnel> = ports
            .into_iter()
            .filter_map(|(key, bindings)| {
                let port = key.split('/').next()?.parse().ok()?;
                let binding = bindings?.into_iter().find(|b| b.host_port.is_some())?;
                let host = match binding.host_ip.as_deref() {
                    None | Some("") | Some("0.0.0.0") => "127.0.0.1".to_string(),
                    Some(ip) => ip.to_string(),
                };
                Some(Tunnel {
                    port,
                    url: format!("http://{}:{}", host, binding.host_port?),
                })
            })
            .collect();
        tunnels.sort_by_key(|t| t.port);
        Ok(tunnels)
    }

    async fn poll(&self) -> Result<Option<i64>> {
        let inspect = match self
            .docker
            .inspect_container(&self.descriptor.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(Some(0)),
            Err(e) => return Err(docker_failure("Failed to inspect sandbox", e)),
        };

        let state = inspect.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(None)
        } else {
            Ok(Some(state.exit_code.unwrap_or(0)))
        }
    }

    async fn terminate(&self) -> Result<()> {
        // Stop the container (with 5s grace period)
        let _ = self
            .docker
            .stop_container(&self.descriptor.id, Some(StopContainerOptions { t: 5 }))
            .await;

        match self
            .docker
            .remove_container(
                &self.descriptor.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(sandbox_id = %self.descriptor.id, "Sandbox container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_failure("Failed to remove sandbox container", e)),
        }
    }
}

// =============================================================================
// Process
// =============================================================================

/// Split the multiplexed exec stream into separate stdout/stderr pipes.
async fn pump_output(
    mut output: LogStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) -> Result<()> {
    while let Some(frame) = output.next().await {
        match frame.map_err(|e| docker_failure("Exec output stream failed", e))? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                stdout.write_all(&message).await?
            }
            LogOutput::StdErr { message } => stderr.write_all(&message).await?,
            LogOutput::StdIn { .. } => {}
        }
    }
    stdout.shutdown().await?;
    stderr.shutdown().await?;
    Ok(())
}

struct DockerProcess {
    docker: Docker,
    exec_id: String,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    pump: Option<JoinHandle<Result<()>>>,
}

#[async_trait]
impl Process for DockerProcess {
    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<Option<i64>> {
        if let Some(pump) = self.pump.take() {
            pump.await
                .map_err(|e| Error::remote(format!("Exec output pump failed: {}", e)))??;
        }

        let inspect = self
            .docker
            .inspect_exec(&self.exec_id)
            .await
            .map_err(|e| docker_failure("Failed to inspect exec result", e))?;
        Ok(inspect.exit_code)
    }
}

impl Drop for DockerProcess {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// =============================================================================
// Files
// =============================================================================

/// Split an absolute file path into its directory and file name.
fn split_path(path: &str) -> Option<(&str, &str)> {
    if !path.starts_with('/') || path.ends_with('/') {
        return None;
    }
    let (dir, name) = path.rsplit_once('/')?;
    Some((if dir.is_empty() { "/" } else { dir }, name))
}

/// Single-entry tar archive holding `content` as `name`.
fn pack_file(name: &str, content: &[u8]) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(Utc::now().timestamp()).unwrap_or(0));

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, content)?;
    Ok(builder.into_inner()?)
}

/// Contents of the first regular file in a tar archive.
fn unpack_file(archive: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    Err(Error::remote("not a regular file"))
}

/// File buffered in memory; writes are uploaded on close.
struct DockerFile {
    docker: Docker,
    container: String,
    dir: String,
    name: String,
    mode: OpenMode,
    buffer: Vec<u8>,
}

#[async_trait]
impl FileHandle for DockerFile {
    async fn read(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.buffer))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.mode != OpenMode::Write {
            return Err(Error::remote("file not opened for writing"));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if self.mode != OpenMode::Write {
            return Ok(());
        }
        let archive = pack_file(&self.name, &self.buffer)?;
        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: self.dir.clone(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| docker_failure("Failed to upload file", e))
    }
}
