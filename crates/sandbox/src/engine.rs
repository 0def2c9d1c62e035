//! Sandbox execution engine.
//!
//! Runs argv-style requests against a session, draining stdout and stderr
//! concurrently so a process blocked on one full pipe can never stall the
//! reader of the other. Shell commands are composed here with every injected
//! value single-quoted.

use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;

use skiff_core::classify::{classify_error, syntax_failure};
use skiff_core::policy::{settle, Operation};
use skiff_core::{CommandOptions, Error, ExecutionRequest, ExecutionResult, Result, RuntimeTag};

use crate::capability::{OutputPipe, Session};
use crate::lifecycle::{LifecycleManager, SandboxHandle};
use crate::runtime;

// =============================================================================
// Process Execution
// =============================================================================

/// Execute one request and collect its output.
///
/// A missing exit status counts as success (0).
pub(crate) async fn execute(
    session: &dyn Session,
    request: &ExecutionRequest,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    let mut process = session.exec(request).await?;

    let stdout = process.take_stdout();
    let stderr = process.take_stderr();
    let (stdout, stderr) = tokio::try_join!(drain(stdout), drain(stderr))?;

    let exit_code = process.wait().await?.unwrap_or(0);

    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
        duration_ms: elapsed_ms(started),
    })
}

async fn drain(pipe: Option<OutputPipe>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// =============================================================================
// Code Execution
// =============================================================================

/// Run a code snippet with the given or detected runtime.
///
/// When the handle's session was provisioned for another runtime, a
/// short-lived session is spawned for this run and torn down afterwards on
/// every path. A non-zero exit whose stderr carries a syntax-error signature
/// is returned as [`Error::Syntax`]; any other exit code is data.
pub async fn run_code(
    lifecycle: &LifecycleManager,
    handle: &SandboxHandle,
    code: &str,
    runtime: Option<RuntimeTag>,
) -> Result<ExecutionResult> {
    let runtime = runtime::resolve(code, runtime);
    let request = ExecutionRequest::for_code(runtime, code);

    let outcome = if runtime == handle.runtime() {
        execute(handle.session().as_ref(), &request).await
    } else {
        let auxiliary = lifecycle.spawn_auxiliary(runtime).await?;
        let teardown = Teardown::arm(auxiliary.session().clone());
        let outcome = execute(auxiliary.session().as_ref(), &request).await;
        teardown.run().await;
        outcome
    };

    let result = outcome.map_err(|e| classify_error("Failed to execute code", e))?;

    if !result.success() {
        if let Some(err) = syntax_failure(&result.stderr) {
            return Err(err);
        }
    }

    Ok(result)
}

/// Terminates an auxiliary session exactly once.
///
/// Dropping an armed guard (cancellation, panic unwinding) hands the
/// termination to the runtime instead.
struct Teardown {
    session: Option<Arc<dyn Session>>,
}

impl Teardown {
    fn arm(session: Arc<dyn Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    async fn run(mut self) {
        if let Some(session) = self.session.take() {
            terminate_quietly(session).await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(terminate_quietly(session));
            }
        }
    }
}

async fn terminate_quietly(session: Arc<dyn Session>) {
    let id = session.descriptor().id.clone();
    let outcome = session.terminate().await;
    if outcome.is_ok() {
        tracing::debug!(sandbox_id = %id, "Auxiliary sandbox torn down");
    }
    settle(Operation::Destroy, outcome, |_| ()).unwrap_or_default()
}

// =============================================================================
// Command Execution
// =============================================================================

/// Run a shell command. Never fails: errors become a result with exit code 127.
pub async fn run_command(
    handle: &SandboxHandle,
    command: &str,
    options: &CommandOptions,
) -> ExecutionResult {
    let started = Instant::now();

    let outcome = async {
        let composed = compose_command(command, options)?;
        let request = ExecutionRequest::shell(composed);
        let result = execute(handle.session().as_ref(), &request).await?;
        Ok::<_, Error>(result)
    }
    .await;

    settle(Operation::RunCommand, outcome, |err| {
        ExecutionResult::from_failure(&err, elapsed_ms(started))
    })
    .unwrap_or_else(|err| ExecutionResult::from_failure(&err, elapsed_ms(started)))
}

/// Layer env exports, a directory change and a background wrapper onto
/// `command`, in that order.
pub fn compose_command(command: &str, options: &CommandOptions) -> Result<String> {
    let mut composed = command.to_string();

    if !options.env.is_empty() {
        let mut vars: Vec<(&String, &String)> = options.env.iter().collect();
        vars.sort();

        let mut assignments = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            if !is_env_name(key) {
                return Err(Error::generic(format!(
                    "Invalid environment variable name: {:?}",
                    key
                )));
            }
            assignments.push(format!("{}={}", key, shell_escape(value)));
        }
        composed = format!("export {} && {}", assignments.join(" "), composed);
    }

    if let Some(cwd) = &options.cwd {
        composed = format!("cd {} && {}", shell_escape(cwd), composed);
    }

    if options.background {
        composed = format!("nohup sh -c {} > /dev/null 2>&1 &", shell_escape(&composed));
    }

    Ok(composed)
}

/// Quote a value for POSIX `sh`. The result is always a single word.
pub fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
