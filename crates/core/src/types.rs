//! Shared result and option types for the sandbox contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Error;

// =============================================================================
// Runtime
// =============================================================================

/// Language runtime a piece of code is executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeTag {
    Node,
    Python,
}

impl RuntimeTag {
    /// Interpreter binary and its inline-evaluation flag.
    pub fn interpreter(self) -> (&'static str, &'static str) {
        match self {
            RuntimeTag::Node => ("node", "-e"),
            RuntimeTag::Python => ("python3", "-c"),
        }
    }
}

impl Default for RuntimeTag {
    fn default() -> Self {
        RuntimeTag::Node
    }
}

impl std::str::FromStr for RuntimeTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "node" | "nodejs" | "js" | "javascript" => Ok(RuntimeTag::Node),
            "python" | "python3" | "py" => Ok(RuntimeTag::Python),
            _ => Err(Error::config(format!("Unsupported runtime: {}", s))),
        }
    }
}

impl std::fmt::Display for RuntimeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeTag::Node => write!(f, "node"),
            RuntimeTag::Python => write!(f, "python"),
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// A single process invocation inside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ExecutionRequest {
    /// Create a request from an argv list.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Interpreter invocation `[interpreter, eval-flag, code]`.
    pub fn for_code(runtime: RuntimeTag, code: &str) -> Self {
        let (interpreter, flag) = runtime.interpreter();
        Self::new([interpreter, flag, code])
    }

    /// `sh -c <command>`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), command.into()])
    }
}

/// Result of executing code or a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Exit code used when no exit status could be obtained at all.
    pub const EXIT_UNAVAILABLE: i64 = 127;

    /// Failure converted into data: empty stdout, error text as stderr.
    pub fn from_failure(err: &Error, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: Self::EXIT_UNAVAILABLE,
            duration_ms,
        }
    }

    /// Whether the execution exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options layered onto a shell command before it runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub background: bool,
}

// =============================================================================
// Filesystem
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Options accepted by sandbox creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    /// Reconnect to an existing session instead of provisioning one.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub runtime: Option<RuntimeTag>,
    /// Free-form creation flags recorded on the session.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CreateOptions {
    pub fn reconnect(id: impl Into<String>) -> Self {
        Self {
            sandbox_id: Some(id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
}

/// Lifecycle info record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub provider: String,
    pub runtime: RuntimeTag,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
    pub metadata: HashMap<String, String>,
}
