//! Sandbox lifecycle: create, reconnect, destroy, info and tunnel URLs.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use skiff_core::classify::{classify_error, lookup_miss};
use skiff_core::config::{AdapterConfig, Credentials};
use skiff_core::policy::{settle, Operation};
use skiff_core::{CreateOptions, Error, Result, RuntimeTag, SandboxInfo, SandboxStatus};

use crate::capability::{SandboxService, Session, SpawnSpec};

const CREATE_CONTEXT: &str = "Failed to create sandbox";

// =============================================================================
// Sandbox Handle
// =============================================================================

/// Reference to a live remote session.
///
/// `id` is the only durable identity. The underlying capability object stays
/// inside the crate.
pub struct SandboxHandle {
    id: String,
    runtime: RuntimeTag,
    created_at: DateTime<Utc>,
    session: Arc<dyn Session>,
}

impl SandboxHandle {
    pub(crate) fn new(session: Arc<dyn Session>) -> Self {
        let descriptor = session.descriptor();
        Self {
            id: descriptor.id.clone(),
            runtime: descriptor.runtime,
            created_at: descriptor.created_at,
            session,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runtime the session was provisioned for.
    pub fn runtime(&self) -> RuntimeTag {
        self.runtime
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Creates, reconnects and destroys sandbox sessions.
pub struct LifecycleManager {
    service: Arc<dyn SandboxService>,
    config: AdapterConfig,
}

impl LifecycleManager {
    pub fn new(service: Arc<dyn SandboxService>, config: AdapterConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Create a sandbox, or reconnect when `options.sandbox_id` is set.
    ///
    /// Credentials are checked before any call to the service.
    pub async fn create(&self, options: &CreateOptions) -> Result<SandboxHandle> {
        let credentials = Credentials::resolve(&self.config)?;

        if let Some(id) = options.sandbox_id.as_deref() {
            let session = self
                .service
                .lookup(&credentials, id)
                .await
                .map_err(|e| classify_error("Failed to reconnect to sandbox", e))?
                .ok_or_else(|| lookup_miss("Sandbox", id))?;
            tracing::info!(sandbox_id = %id, "Reconnected to sandbox");
            return Ok(SandboxHandle::new(session));
        }

        let runtime = options.runtime.unwrap_or(self.config.runtime);
        let mut metadata = options.metadata.clone();
        if let Some(environment) = &self.config.environment {
            metadata
                .entry("environment".into())
                .or_insert_with(|| environment.clone());
        }

        let spec = SpawnSpec {
            image: options
                .image
                .clone()
                .unwrap_or_else(|| self.config.images.for_runtime(runtime).to_string()),
            runtime,
            timeout: options
                .timeout_ms
                .or(self.config.timeout_ms)
                .map(Duration::from_millis),
            ports: options
                .ports
                .clone()
                .unwrap_or_else(|| self.config.ports.clone()),
            metadata,
        };

        self.provision(&credentials, &spec).await
    }

    /// Short-lived session for running code under a different runtime.
    pub(crate) async fn spawn_auxiliary(&self, runtime: RuntimeTag) -> Result<SandboxHandle> {
        let credentials = Credentials::resolve(&self.config)?;
        let spec = SpawnSpec {
            image: self.config.images.for_runtime(runtime).to_string(),
            runtime,
            timeout: self.config.timeout_ms.map(Duration::from_millis),
            ports: Vec::new(),
            metadata: [("auxiliary".to_string(), "true".to_string())].into(),
        };
        self.provision(&credentials, &spec).await
    }

    async fn provision(&self, credentials: &Credentials, spec: &SpawnSpec) -> Result<SandboxHandle> {
        let app = self
            .service
            .lookup_app(credentials, &self.config.app_name, true)
            .await
            .map_err(|e| classify_error(CREATE_CONTEXT, e))?;

        let session = self
            .service
            .spawn(credentials, &app, spec)
            .await
            .map_err(|e| classify_error(CREATE_CONTEXT, e))?;

        let handle = SandboxHandle::new(session);
        tracing::info!(
            sandbox_id = %handle.id(),
            app = %app.name,
            image = %spec.image,
            runtime = %spec.runtime,
            "Sandbox created"
        );
        Ok(handle)
    }

    /// Look up an existing session. Every failure, not just a miss, is `None`.
    pub async fn reconnect(&self, id: &str) -> Option<SandboxHandle> {
        let outcome = async {
            let credentials = Credentials::resolve(&self.config)?;
            let session = self.service.lookup(&credentials, id).await?;
            Ok::<_, Error>(session.map(SandboxHandle::new))
        }
        .await;

        settle(Operation::Reconnect, outcome, |_| None).unwrap_or_default()
    }

    /// Terminate a session by id. Never fails; destroying twice is a no-op.
    pub async fn destroy(&self, id: &str) {
        let outcome = async {
            let credentials = Credentials::resolve(&self.config)?;
            if let Some(session) = self.service.lookup(&credentials, id).await? {
                session.terminate().await?;
                tracing::info!(sandbox_id = %id, "Sandbox destroyed");
            }
            Ok::<_, Error>(())
        }
        .await;

        settle(Operation::Destroy, outcome, |_| ()).unwrap_or_default()
    }

    /// Info record. A failed poll reports the session as running.
    pub async fn get_info(&self, handle: &SandboxHandle) -> SandboxInfo {
        let session = handle.session();
        let descriptor = session.descriptor();

        let status = settle(
            Operation::GetInfo,
            session.poll().await.map(|exit| match exit {
                Some(_) => SandboxStatus::Stopped,
                None => SandboxStatus::Running,
            }),
            |_| SandboxStatus::Running,
        )
        .unwrap_or(SandboxStatus::Running);

        let mut metadata = descriptor.metadata.clone();
        metadata.insert("app".into(), descriptor.app.clone());
        metadata.insert("image".into(), descriptor.image.clone());

        SandboxInfo {
            id: handle.id().to_string(),
            provider: self.service.name().to_string(),
            runtime: handle.runtime(),
            status,
            created_at: handle.created_at(),
            timeout_ms: descriptor.timeout.map(|t| t.as_millis() as u64),
            metadata,
        }
    }

    /// Public URL for an exposed port, optionally with a different scheme.
    pub async fn get_url(
        &self,
        handle: &SandboxHandle,
        port: u16,
        protocol: Option<&str>,
    ) -> Result<String> {
        let tunnels = handle
            .session()
            .tunnels()
            .await
            .map_err(|e| classify_error("Failed to look up tunnels", e))?;

        let tunnel = tunnels.iter().find(|t| t.port == port).ok_or_else(|| {
            let mut available: Vec<u16> = tunnels.iter().map(|t| t.port).collect();
            available.sort_unstable();
            if available.is_empty() {
                Error::not_found(format!(
                    "No tunnel for port {} on sandbox '{}'. The sandbox exposes no ports",
                    port,
                    handle.id()
                ))
            } else {
                let list: Vec<String> = available.iter().map(|p| p.to_string()).collect();
                Error::not_found(format!(
                    "No tunnel for port {} on sandbox '{}'. Available ports: {}",
                    port,
                    handle.id(),
                    list.join(", ")
                ))
            }
        })?;

        Ok(match protocol {
            Some(scheme) => rewrite_scheme(&tunnel.url, scheme),
            None => tunnel.url.clone(),
        })
    }

    /// Ids of live sessions owned by the configured credentials.
    pub async fn list(&self) -> Result<Vec<String>> {
        let credentials = Credentials::resolve(&self.config)?;
        self.service
            .list(&credentials)
            .await
            .map_err(|e| classify_error("Failed to list sandboxes", e))
    }

    pub async fn is_available(&self) -> bool {
        self.service.is_available().await
    }

    pub fn provider_name(&self) -> &str {
        self.service.name()
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("provider", &self.provider_name())
            .finish_non_exhaustive()
    }
}

/// Replace the scheme of `url`, leaving every other component untouched.
fn rewrite_scheme(url: &str, scheme: &str) -> String {
    let scheme = scheme.trim_end_matches("://").trim_end_matches(':');
    match url.split_once("://") {
        Some((_, rest)) => format!("{}://{}", scheme, rest),
        None => format!("{}://{}", scheme, url),
    }
}
