//! Capability interface over the remote sandbox service.
//!
//! The service SDK is treated as unstable, so the adapter never touches it
//! directly. Each backend implements these traits and the rest of the crate
//! consumes them as trait objects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use skiff_core::config::Credentials;
use skiff_core::{ExecutionRequest, Result, RuntimeTag};

/// Readable end of a process output stream.
pub type OutputPipe = Pin<Box<dyn AsyncRead + Send>>;

/// Logical application namespace on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRef {
    pub id: String,
    pub name: String,
}

/// Parameters for provisioning a new session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub image: String,
    pub runtime: RuntimeTag,
    pub timeout: Option<Duration>,
    pub ports: Vec<u16>,
    pub metadata: HashMap<String, String>,
}

/// What a backend knows about a session without asking the service again.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub id: String,
    pub app: String,
    pub image: String,
    pub runtime: RuntimeTag,
    pub created_at: DateTime<Utc>,
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
}

/// A port exposed by a session through the service's tunnel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub port: u16,
    pub url: String,
}

/// Entry point of a sandbox service.
#[async_trait]
pub trait SandboxService: Send + Sync {
    /// Backend name reported in session info.
    fn name(&self) -> &str;

    /// Look up an application namespace, creating it when asked to.
    async fn lookup_app(
        &self,
        credentials: &Credentials,
        name: &str,
        create_if_missing: bool,
    ) -> Result<AppRef>;

    /// Provision a new session.
    async fn spawn(
        &self,
        credentials: &Credentials,
        app: &AppRef,
        spec: &SpawnSpec,
    ) -> Result<Arc<dyn Session>>;

    /// Find an existing session by id. `Ok(None)` when it does not exist.
    async fn lookup(&self, credentials: &Credentials, id: &str)
        -> Result<Option<Arc<dyn Session>>>;

    /// Ids of live sessions visible to these credentials.
    async fn list(&self, _credentials: &Credentials) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Whether the backend can be reached at all.
    async fn is_available(&self) -> bool;
}

/// A live remote session.
#[async_trait]
pub trait Session: Send + Sync {
    fn descriptor(&self) -> &SessionDescriptor;

    /// Start a process with piped stdout and stderr.
    async fn exec(&self, request: &ExecutionRequest) -> Result<Box<dyn Process>>;

    /// Structured file access. Backends without one return an error.
    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>>;

    async fn tunnels(&self) -> Result<Vec<Tunnel>>;

    /// `Ok(None)` while running, `Ok(Some(code))` once finished.
    async fn poll(&self) -> Result<Option<i64>>;

    async fn terminate(&self) -> Result<()>;
}

/// A process started by [`Session::exec`].
#[async_trait]
pub trait Process: Send {
    fn take_stdout(&mut self) -> Option<OutputPipe>;

    fn take_stderr(&mut self) -> Option<OutputPipe>;

    /// Wait for exit. `Ok(None)` when the service reports no status.
    async fn wait(&mut self) -> Result<Option<i64>>;
}

/// An open file inside a session.
#[async_trait]
pub trait FileHandle: Send {
    async fn read(&mut self) -> Result<Vec<u8>>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}
