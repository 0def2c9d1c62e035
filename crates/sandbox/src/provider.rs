//! Adapter facade: the uniform sandbox contract.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use skiff_core::config::AdapterConfig;
use skiff_core::{
    CommandOptions, CreateOptions, ExecutionResult, Result, RuntimeTag, SandboxInfo,
};

use crate::capability::SandboxService;
use crate::engine;
use crate::fs::Filesystem;
use crate::lifecycle::{LifecycleManager, SandboxHandle};

/// Entry point: creates and finds sandboxes on one backend.
#[derive(Clone)]
pub struct SandboxProvider {
    lifecycle: Arc<LifecycleManager>,
}

impl SandboxProvider {
    pub fn new(service: Arc<dyn SandboxService>, config: AdapterConfig) -> Self {
        Self {
            lifecycle: Arc::new(LifecycleManager::new(service, config)),
        }
    }

    /// Backend name, e.g. `docker`.
    pub fn name(&self) -> &str {
        self.lifecycle.provider_name()
    }

    pub fn config(&self) -> &AdapterConfig {
        self.lifecycle.config()
    }

    /// Create a sandbox. With `options.sandbox_id` set this reconnects
    /// instead and a missing session is an error.
    pub async fn create(&self, options: &CreateOptions) -> Result<Sandbox> {
        let handle = self.lifecycle.create(options).await?;
        Ok(self.wrap(handle))
    }

    /// Reconnect to an existing sandbox. `None` on any failure.
    pub async fn get_by_id(&self, id: &str) -> Option<Sandbox> {
        self.lifecycle
            .reconnect(id)
            .await
            .map(|handle| self.wrap(handle))
    }

    /// Best-effort destroy by id.
    pub async fn destroy(&self, id: &str) {
        self.lifecycle.destroy(id).await
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.lifecycle.list().await
    }

    pub async fn is_available(&self) -> bool {
        self.lifecycle.is_available().await
    }

    fn wrap(&self, handle: SandboxHandle) -> Sandbox {
        Sandbox {
            handle,
            lifecycle: self.lifecycle.clone(),
        }
    }
}

/// A live sandbox.
#[derive(Debug)]
pub struct Sandbox {
    handle: SandboxHandle,
    lifecycle: Arc<LifecycleManager>,
}

impl Sandbox {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn runtime(&self) -> RuntimeTag {
        self.handle.runtime()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.handle.created_at()
    }

    /// Run code, detecting the runtime when `runtime` is `None`.
    pub async fn run_code(&self, code: &str, runtime: Option<RuntimeTag>) -> Result<ExecutionResult> {
        engine::run_code(&self.lifecycle, &self.handle, code, runtime).await
    }

    /// Run a shell command. Failures come back as exit code 127.
    pub async fn run_command(&self, command: &str, options: &CommandOptions) -> ExecutionResult {
        engine::run_command(&self.handle, command, options).await
    }

    pub async fn get_info(&self) -> SandboxInfo {
        self.lifecycle.get_info(&self.handle).await
    }

    pub async fn get_url(&self, port: u16, protocol: Option<&str>) -> Result<String> {
        self.lifecycle.get_url(&self.handle, port, protocol).await
    }

    pub fn fs(&self) -> Filesystem<'_> {
        Filesystem::new(&self.handle)
    }

    /// Destroy this sandbox. Never fails.
    pub async fn destroy(self) {
        self.lifecycle.destroy(self.handle.id()).await
    }
}
