//! Host-process sandbox service.
//!
//! Sessions are working directories under a root folder and commands run as
//! ordinary child processes. This is a development backend: it provides no
//! isolation from the host.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<session-id>/          working directory
//! <root>/.sessions/<id>.json    session record, read back by lookup and list
//! <root>/.apps/<name>/          app namespaces
//! ```
//!
//! Every lookup goes through the records on disk, so a session created by one
//! process can be reached, listed and destroyed from another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use skiff_core::config::Credentials;
use skiff_core::{Error, ExecutionRequest, Result, RuntimeTag};

use crate::capability::{
    AppRef, FileHandle, OpenMode, OutputPipe, Process, SandboxService, Session,
    SessionDescriptor, SpawnSpec, Tunnel,
};

const SESSION_PREFIX: &str = "local-";
const RECORDS_DIR: &str = ".sessions";
const APPS_DIR: &str = ".apps";

/// Sandbox service backed by local child processes.
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    /// Sessions live under `$TMPDIR/skiff-local`.
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir().join("skiff-local"))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{}.json", id))
    }

    /// Load a session from its record. `None` when it does not exist.
    async fn load(&self, id: &str) -> Result<Option<LocalSession>> {
        if !is_session_id(id) {
            return Ok(None);
        }

        let path = self.record_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SessionRecord = serde_json::from_slice(&raw).map_err(|e| {
            Error::remote(format!("corrupt session record {}: {}", path.display(), e))
        })?;

        let workdir = self.root.join(&record.id);
        if !tokio::fs::try_exists(&workdir).await.unwrap_or(false) {
            // Working directory removed behind our back: the session is gone.
            remove_if_present(tokio::fs::remove_file(&path).await)?;
            return Ok(None);
        }

        Ok(Some(LocalSession::from_record(record, workdir, path)))
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn is_session_id(id: &str) -> bool {
    id.strip_prefix(SESSION_PREFIX).is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn remove_if_present(outcome: std::io::Result<()>) -> Result<()> {
    match outcome {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// On-disk form of a session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    app: String,
    image: String,
    runtime: RuntimeTag,
    owner: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[async_trait]
impl SandboxService for LocalSandbox {
    fn name(&self) -> &str {
        "local"
    }

    async fn lookup_app(
        &self,
        _credentials: &Credentials,
        name: &str,
        create_if_missing: bool,
    ) -> Result<AppRef> {
        let dir = self.root.join(APPS_DIR).join(name);
        if !tokio::fs::try_exists(&dir).await? {
            if !create_if_missing {
                return Err(Error::remote(format!("app '{}' does not exist", name)));
            }
            tokio::fs::create_dir_all(&dir).await?;
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
        let id = format!("{}{}", SESSION_PREFIX, uuid::Uuid::new_v4());
        let workdir = self.root.join(&id);
        tokio::fs::create_dir_all(&workdir).await?;
        tokio::fs::create_dir_all(self.root.join(RECORDS_DIR)).await?;

        let created_at = Utc::now();
        let record = SessionRecord {
            id: id.clone(),
            app: app.name.clone(),
            image: spec.image.clone(),
            runtime: spec.runtime,
            owner: credentials.token_id.clone(),
            created_at,
            timeout_ms: spec
                .timeout
                .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            deadline: spec.timeout.and_then(|timeout| {
                chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|timeout| created_at.checked_add_signed(timeout))
            }),
            ports: spec.ports.clone(),
            metadata: spec.metadata.clone(),
        };

        let path = self.record_path(&id);
        let encoded = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::remote(format!("failed to encode session record: {}", e)))?;
        tokio::fs::write(&path, encoded).await?;

        let session = LocalSession::from_record(record, workdir, path);
        tracing::debug!(sandbox_id = %id, workdir = %session.workdir.display(), "Local session started");
        Ok(Arc::new(session))
    }

    async fn lookup(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> Result<Option<Arc<dyn Session>>> {
        Ok(self
            .load(id)
            .await?
            .filter(|s| s.owner == credentials.token_id)
            .map(|s| Arc::new(s) as Arc<dyn Session>))
    }

    /// Live sessions only; expired ones stay reachable through `lookup`.
    async fn list(&self, credentials: &Credentials) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.root.join(RECORDS_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(id) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.load(id).await {
                Ok(Some(session))
                    if session.owner == credentials.token_id && !session.is_expired() =>
                {
                    ids.push(session.descriptor.id)
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(sandbox_id = %id, error = %e, "Skipping unreadable session record")
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn is_available(&self) -> bool {
        tokio::fs::create_dir_all(&self.root).await.is_ok()
    }
}

struct LocalSession {
    descriptor: SessionDescriptor,
    owner: String,
    workdir: PathBuf,
    record: PathBuf,
    ports: Vec<u16>,
    deadline: Option<DateTime<Utc>>,
    terminated: AtomicBool,
}

impl LocalSession {
    fn from_record(record: SessionRecord, workdir: PathBuf, path: PathBuf) -> Self {
        Self {
            descriptor: SessionDescriptor {
                id: record.id,
                app: record.app,
                image: record.image,
                runtime: record.runtime,
                created_at: record.created_at,
                timeout: record.timeout_ms.map(Duration::from_millis),
                metadata: record.metadata,
            },
            owner: record.owner,
            workdir,
            record: path,
            ports: record.ports,
            deadline: record.deadline,
            terminated: AtomicBool::new(false),
        }
    }

    fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Utc::now() >= deadline)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::remote(format!(
                "sandbox {} has been terminated",
                self.descriptor.id
            )));
        }
        if self.is_expired() {
            return Err(Error::remote(format!(
                "sandbox {} has exceeded its timeout",
                self.descriptor.id
            )));
        }
        Ok(())
    }

    /// Relative paths resolve against the session's working directory.
    fn resolve(&self, path: &str) -> PathBuf {
        self.workdir.join(path)
    }
}

#[async_trait]
impl Session for LocalSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn exec(&self, request: &ExecutionRequest) -> Result<Box<dyn Process>> {
        self.ensure_live()?;

        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| Error::remote("empty argv"))?;

        let cwd = match &request.cwd {
            Some(cwd) => self.resolve(cwd),
            None => self.workdir.clone(),
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(&request.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|s| Box::pin(s) as OutputPipe);
        let stderr = child.stderr.take().map(|s| Box::pin(s) as OutputPipe);

        Ok(Box::new(LocalProcess {
            child,
            stdout,
            stderr,
        }))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        self.ensure_live()?;
        let path = self.resolve(path);
        let file = match mode {
            OpenMode::Read => tokio::fs::File::open(&path).await?,
            OpenMode::Write => tokio::fs::File::create(&path).await?,
        };
        Ok(Box::new(LocalFile { file }))
    }

    async fn tunnels(&self) -> Result<Vec<Tunnel>> {
        Ok(self
            .ports
            .iter()
            .map(|port| Tunnel {
                port: *port,
                url: format!("http://127.0.0.1:{}", port),
            })
            .collect())
    }

    async fn poll(&self) -> Result<Option<i64>> {
        Ok((self.is_terminated() || self.is_expired()).then_some(0))
    }

    async fn terminate(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        remove_if_present(tokio::fs::remove_dir_all(&self.workdir).await)?;
        remove_if_present(tokio::fs::remove_file(&self.record).await)?;
        tracing::debug!(sandbox_id = %self.descriptor.id, "Local session terminated");
        Ok(())
    }
}

struct LocalProcess {
    child: tokio::process::Child,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
}

#[async_trait]
impl Process for LocalProcess {
    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<Option<i64>> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }
}

/// Exit code, or `128 + signal` for a signalled process.
fn exit_code(status: ExitStatus) -> Option<i64> {
    if let Some(code) = status.code() {
        return Some(code.into());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + i64::from(signal));
        }
    }
    None
}

struct LocalFile {
    file: tokio::fs::File,
}

#[async_trait]
impl FileHandle for LocalFile {
    async fn read(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.file.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}
