//! In-memory sandbox service for tests.

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use skiff_core::config::Credentials;
use skiff_core::{Error, ExecutionRequest, Result};

use crate::capability::{
    AppRef, FileHandle, OpenMode, OutputPipe, Process, SandboxService, Session,
    SessionDescriptor, SpawnSpec, Tunnel,
};

/// Scripted outcome of one `exec` call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output {
        stdout: String,
        stderr: String,
        /// `None` simulates a service that reports no exit status.
        exit_code: Option<i64>,
    },
    /// `exec` itself fails with this raw message.
    ExecError(String),
}

impl MockResponse {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        MockResponse::Output {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failure(stderr: impl Into<String>, exit_code: i64) -> Self {
        MockResponse::Output {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// One recorded `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub session_id: String,
    pub argv: Vec<String>,
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<MockResponse>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    executed: Mutex<Vec<ExecRecord>>,
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
    apps: Mutex<HashSet<String>>,
    required_token: Mutex<Option<(String, String)>>,
    spawn_failure: Mutex<Option<String>>,
    lookup_failure: Mutex<Option<String>>,
    poll_failure: Mutex<Option<String>>,
    file_api_disabled: AtomicBool,
    spawned: AtomicUsize,
    terminated: AtomicUsize,
}

/// In-memory mock sandbox service.
///
/// Clones share state, so a test can keep one clone for inspection after
/// handing another to the provider.
#[derive(Clone, Default)]
pub struct MockSandbox {
    state: Arc<MockState>,
}

impl MockSandbox {
    /// Create a mock with predefined exec responses, consumed in order. Once
    /// the queue is empty every exec succeeds with empty output.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            state: Arc::new(MockState {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }),
        }
    }

    /// Make every `open` fail so file operations take the shell fallback.
    pub fn disable_file_api(&self) {
        self.state.file_api_disabled.store(true, Ordering::SeqCst);
    }

    /// Reject any other token pair with an "unauthorized" failure.
    pub async fn require_token(&self, token_id: &str, token_secret: &str) {
        *self.state.required_token.lock().await =
            Some((token_id.to_string(), token_secret.to_string()));
    }

    pub async fn fail_spawns_with(&self, message: impl Into<String>) {
        *self.state.spawn_failure.lock().await = Some(message.into());
    }

    pub async fn fail_lookups_with(&self, message: impl Into<String>) {
        *self.state.lookup_failure.lock().await = Some(message.into());
    }

    pub async fn fail_polls_with(&self, message: impl Into<String>) {
        *self.state.poll_failure.lock().await = Some(message.into());
    }

    pub async fn put_file(&self, path: &str, content: &[u8]) {
        self.state
            .files
            .lock()
            .await
            .insert(path.to_string(), content.to_vec());
    }

    pub async fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().await.get(path).cloned()
    }

    pub async fn executed(&self) -> Vec<ExecRecord> {
        self.state.executed.lock().await.clone()
    }

    pub async fn live_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn spawn_count(&self) -> usize {
        self.state.spawned.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.state.terminated.load(Ordering::SeqCst)
    }

    async fn authorize(&self, credentials: &Credentials) -> Result<()> {
        match &*self.state.required_token.lock().await {
            Some((id, secret))
                if *id != credentials.token_id
                    || secret != credentials.token_secret.expose_secret() =>
            {
                Err(Error::remote("401 Unauthorized: token rejected"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SandboxService for MockSandbox {
    fn name(&self) -> &str {
        "mock"
    }

    async fn lookup_app(
        &self,
        credentials: &Credentials,
        name: &str,
        create_if_missing: bool,
    ) -> Result<AppRef> {
        self.authorize(credentials).await?;
        let mut apps = self.state.apps.lock().await;
        if !apps.contains(name) {
            if !create_if_missing {
                return Err(Error::remote(format!("app '{}' does not exist", name)));
            }
            apps.insert(name.to_string());
        }
        Ok(AppRef {
            id: format!("app-{}", name),
            name: name.to_string(),
        })
    }

    async fn spawn(
        &self,
        credentials: &Credentials,
        app: &AppRef,
        spec: &SpawnSpec,
    ) -> Result<Arc<dyn Session>> {
        self.authorize(credentials).await?;
        if let Some(message) = self.state.spawn_failure.lock().await.clone() {
            return Err(Error::remote(message));
        }

        let id = format!("mock-sandbox-{}", uuid::Uuid::new_v4());
        let tunnels = spec
            .ports
            .iter()
            .map(|port| Tunnel {
                port: *port,
                url: format!("https://{}-{}.tunnel.mock", id, port),
            })
            .collect();

        let session = Arc::new(MockSession {
            descriptor: SessionDescriptor {
                id: id.clone(),
                app: app.name.clone(),
                image: spec.image.clone(),
                runtime: spec.runtime,
                created_at: Utc::now(),
                timeout: spec.timeout,
                metadata: spec.metadata.clone(),
            },
            tunnels,
            terminated: AtomicBool::new(false),
            state: self.state.clone(),
        });

        self.state.sessions.lock().await.insert(id, session.clone());
        self.state.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(session)
    }

    async fn lookup(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> Result<Option<Arc<dyn Session>>> {
        self.authorize(credentials).await?;
        if let Some(message) = self.state.lookup_failure.lock().await.clone() {
            return Err(Error::remote(message));
        }
        let sessions = self.state.sessions.lock().await;
        Ok(sessions
            .get(id)
            .map(|session| session.clone() as Arc<dyn Session>))
    }

    async fn list(&self, credentials: &Credentials) -> Result<Vec<String>> {
        self.authorize(credentials).await?;
        Ok(self.live_sessions().await)
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct MockSession {
    descriptor: SessionDescriptor,
    tunnels: Vec<Tunnel>,
    terminated: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl Session for MockSession {
    fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    async fn exec(&self, request: &ExecutionRequest) -> Result<Box<dyn Process>> {
        self.state.executed.lock().await.push(ExecRecord {
            session_id: self.descriptor.id.clone(),
            argv: request.argv.clone(),
        });

        let response = self
            .state
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| MockResponse::stdout(""));

        match response {
            MockResponse::Output {
                stdout,
                stderr,
                exit_code,
            } => Ok(Box::new(MockProcess {
                stdout: Some(pipe(stdout)),
                stderr: Some(pipe(stderr)),
                exit_code,
            })),
            MockResponse::ExecError(message) => Err(Error::remote(message)),
        }
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>> {
        if self.state.file_api_disabled.load(Ordering::SeqCst) {
            return Err(Error::remote("file API unavailable"));
        }
        if mode == OpenMode::Read && !self.state.files.lock().await.contains_key(path) {
            return Err(Error::remote(format!("No such file: {}", path)));
        }
        Ok(Box::new(MockFile {
            path: path.to_string(),
            mode,
            buffer: Vec::new(),
            state: self.state.clone(),
        }))
    }

    async fn tunnels(&self) -> Result<Vec<Tunnel>> {
        Ok(self.tunnels.clone())
    }

    async fn poll(&self) -> Result<Option<i64>> {
        if let Some(message) = self.state.poll_failure.lock().await.clone() {
            return Err(Error::remote(message));
        }
        Ok(self.terminated.load(Ordering::SeqCst).then_some(0))
    }

    async fn terminate(&self) -> Result<()> {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.state.sessions.lock().await.remove(&self.descriptor.id);
            self.state.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn pipe(text: String) -> OutputPipe {
    Box::pin(Cursor::new(text.into_bytes()))
}

struct MockProcess {
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    exit_code: Option<i64>,
}

#[async_trait]
impl Process for MockProcess {
    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<Option<i64>> {
        Ok(self.exit_code)
    }
}

struct MockFile {
    path: String,
    mode: OpenMode,
    buffer: Vec<u8>,
    state: Arc<MockState>,
}

#[async_trait]
impl FileHandle for MockFile {
    async fn read(&mut self) -> Result<Vec<u8>> {
        self.state
            .files
            .lock()
            .await
            .get(&self.path)
            .cloned()
            .ok_or_else(|| Error::remote(format!("No such file: {}", self.path)))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.mode != OpenMode::Write {
            return Err(Error::remote(format!("{} is not open for writing", self.path)));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let MockFile {
            path,
            mode,
            buffer,
            state,
        } = *self;
        if mode == OpenMode::Write {
            state.files.lock().await.insert(path, buffer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn creds() -> Credentials {
        Credentials::new("id", "secret")
    }

    fn spec() -> SpawnSpec {
        SpawnSpec {
            image: "node:20-slim".into(),
            runtime: skiff_core::RuntimeTag::Node,
            timeout: None,
            ports: vec![3000],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_sandbox_lifecycle() {
        let mock = MockSandbox::new(vec![MockResponse::stdout("hello")]);
        let app = mock.lookup_app(&creds(), "skiff-sandbox", true).await.unwrap();
        let session = mock.spawn(&creds(), &app, &spec()).await.unwrap();

        let mut process = session.exec(&ExecutionRequest::shell("echo hello")).await.unwrap();
        let mut out = String::new();
        process
            .take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(process.wait().await.unwrap(), Some(0));

        assert!(mock.lookup(&creds(), &session.descriptor().id).await.unwrap().is_some());
        session.terminate().await.unwrap();
        session.terminate().await.unwrap();
        assert_eq!(mock.terminate_count(), 1);
        assert!(mock.lookup(&creds(), &session.descriptor().id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_file_round_trip() {
        let mock = MockSandbox::default();
        let app = mock.lookup_app(&creds(), "app", true).await.unwrap();
        let session = mock.spawn(&creds(), &app, &spec()).await.unwrap();

        assert!(session.open("missing.txt", OpenMode::Read).await.is_err());

        let mut file = session.open("a.txt", OpenMode::Write).await.unwrap();
        file.write(b"hello ").await.unwrap();
        file.write(b"world").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(mock.file("a.txt").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_mock_rejects_wrong_token() {
        let mock = MockSandbox::default();
        mock.require_token("id", "other").await;
        let err = mock.lookup_app(&creds(), "app", true).await.unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_missing_app_without_create() {
        let mock = MockSandbox::default();
        assert!(mock.lookup_app(&creds(), "nope", false).await.is_err());
    }
}
