use config::{Config, ConfigError, Environment, File};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::RuntimeTag;

/// Environment variable holding the token identifier.
pub const TOKEN_ID_ENV: &str = "SKIFF_TOKEN_ID";
/// Environment variable holding the token secret.
pub const TOKEN_SECRET_ENV: &str = "SKIFF_TOKEN_SECRET";

/// Logical application namespace sessions are provisioned under.
pub const DEFAULT_APP_NAME: &str = "skiff-sandbox";

#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_secret: Option<Secret<String>>,
    #[serde(default)]
    pub runtime: RuntimeTag,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub images: ImageConfig,
}

/// Default images per runtime. Either entry can be overridden alone.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImageConfig {
    pub node: String,
    pub python: String,
}

impl ImageConfig {
    pub fn for_runtime(&self, runtime: RuntimeTag) -> &str {
        match runtime {
            RuntimeTag::Node => &self.node,
            RuntimeTag::Python => &self.python,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            node: "node:20-slim".into(),
            python: "python:3.12-slim".into(),
        }
    }
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.into()
}

impl AdapterConfig {
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("SKIFF_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map SKIFF_TIMEOUT_MS=60000 to timeout_ms, SKIFF_IMAGES__NODE to images.node
            .add_source(
                Environment::with_prefix("SKIFF")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("ports"),
            )
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            token_id: None,
            token_secret: None,
            runtime: RuntimeTag::default(),
            timeout_ms: None,
            environment: None,
            ports: Vec::new(),
            app_name: default_app_name(),
            images: ImageConfig::default(),
        }
    }
}

/// Token pair used to authenticate against the sandbox service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token_id: String,
    pub token_secret: Secret<String>,
}

impl Credentials {
    pub fn new(token_id: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            token_secret: Secret::new(token_secret.into()),
        }
    }

    /// Resolve credentials from explicit config, falling back to the environment.
    ///
    /// Fails with an auth error naming the missing field. No network call is
    /// made here.
    pub fn resolve(config: &AdapterConfig) -> Result<Self> {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    /// Same as [`Credentials::resolve`] with an injectable environment lookup.
    pub fn resolve_with(
        config: &AdapterConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let token_id = config
            .token_id
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| env(TOKEN_ID_ENV).filter(|v| !v.is_empty()))
            .ok_or_else(|| {
                Error::auth(format!(
                    "Missing token id. Set token_id in the adapter config or the {} environment variable",
                    TOKEN_ID_ENV
                ))
            })?;

        let token_secret = config
            .token_secret
            .as_ref()
            .map(|s| s.expose_secret().clone())
            .filter(|v| !v.is_empty())
            .or_else(|| env(TOKEN_SECRET_ENV).filter(|v| !v.is_empty()))
            .ok_or_else(|| {
                Error::auth(format!(
                    "Missing token secret. Set token_secret in the adapter config or the {} environment variable",
                    TOKEN_SECRET_ENV
                ))
            })?;

        Ok(Self::new(token_id, token_secret))
    }
}
