//! Filesystem façade.
//!
//! Each operation is an ordered chain of strategies: the session's structured
//! file API first where one exists, then an equivalent POSIX utility run
//! through the execution engine. A later strategy runs only after the previous
//! one failed, and when all fail the *first* error is reported.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use skiff_core::classify::classify;
use skiff_core::policy::{settle, Operation};
use skiff_core::{Error, ExecutionRequest, ExecutionResult, FileEntry, FileKind, Result};

use crate::capability::{OpenMode, Session};
use crate::engine::{execute, shell_escape};
use crate::lifecycle::SandboxHandle;

type Attempt<'a, T> = BoxFuture<'a, Result<T>>;

/// Run attempts in order until one succeeds; otherwise return the first error.
async fn first_success<T>(attempts: Vec<Attempt<'_, T>>) -> Result<T> {
    let mut first_error = None;
    for attempt in attempts {
        match attempt.await {
            Ok(value) => return Ok(value),
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(_) => {}
        }
    }
    Err(first_error.unwrap_or_else(|| Error::generic("no strategy available")))
}

/// File operations on a sandbox.
pub struct Filesystem<'a> {
    handle: &'a SandboxHandle,
}

impl<'a> Filesystem<'a> {
    pub fn new(handle: &'a SandboxHandle) -> Self {
        Self { handle }
    }

    fn session(&self) -> &'a dyn Session {
        self.handle.session().as_ref()
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let session = self.session();
        let outcome = first_success(vec![
            read_via_file_api(session, path).boxed(),
            async move {
                let result = run_utility(session, ExecutionRequest::new(["cat", path])).await?;
                Ok::<_, Error>(result.stdout)
            }
            .boxed(),
        ])
        .await;

        settle(Operation::ReadFile, outcome, |_| String::new())
            .map_err(|e| path_failure("read file", path, e))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let session = self.session();
        let script = format!("printf '%s' {} > {}", shell_escape(content), shell_escape(path));
        let outcome = first_success(vec![
            write_via_file_api(session, path, content.as_bytes()).boxed(),
            async move {
                run_utility(session, ExecutionRequest::shell(script)).await?;
                Ok::<_, Error>(())
            }
            .boxed(),
        ])
        .await;

        settle(Operation::WriteFile, outcome, |_| ()).map_err(|e| path_failure("write file", path, e))
    }

    /// `mkdir -p`; creating an existing directory succeeds.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let outcome = run_utility(self.session(), ExecutionRequest::new(["mkdir", "-p", path]))
            .await
            .map(|_| ());

        settle(Operation::Mkdir, outcome, |_| ()).map_err(|e| path_failure("create directory", path, e))
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let outcome = run_utility(self.session(), ExecutionRequest::new(["ls", "-la", path]))
            .await
            .map(|result| parse_listing(&result.stdout, Utc::now()));

        settle(Operation::Readdir, outcome, |_| Vec::new())
            .map_err(|e| path_failure("list directory", path, e))
    }

    /// `test -e`. Any failure, not only a non-zero exit, means `false`.
    pub async fn exists(&self, path: &str) -> bool {
        let outcome = execute(self.session(), &ExecutionRequest::new(["test", "-e", path]))
            .await
            .map(|result| result.success());

        settle(Operation::Exists, outcome, |_| false).unwrap_or(false)
    }

    /// `rm -rf`; removing a missing path succeeds.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let outcome = run_utility(self.session(), ExecutionRequest::new(["rm", "-rf", path]))
            .await
            .map(|_| ());

        settle(Operation::Remove, outcome, |_| ()).map_err(|e| path_failure("remove", path, e))
    }
}

async fn read_via_file_api(session: &dyn Session, path: &str) -> Result<String> {
    let mut file = session.open(path, OpenMode::Read).await?;
    let data = file.read().await;
    let closed = file.close().await;
    let data = data?;
    closed?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

async fn write_via_file_api(session: &dyn Session, path: &str, content: &[u8]) -> Result<()> {
    let mut file = session.open(path, OpenMode::Write).await?;
    let written = file.write(content).await;
    let closed = file.close().await;
    written?;
    closed
}

/// Run a utility and treat a non-zero exit as failure.
async fn run_utility(session: &dyn Session, request: ExecutionRequest) -> Result<ExecutionResult> {
    let result = execute(session, &request).await?;
    if result.success() {
        return Ok(result);
    }

    // The utility ran, so the service itself is fine: nothing to classify.
    let utility = request.argv.first().map(String::as_str).unwrap_or("command");
    let stderr = result.stderr.trim();
    Err(Error::generic(if stderr.is_empty() {
        format!("{} exited with status {}", utility, result.exit_code)
    } else {
        format!("{} exited with status {}: {}", utility, result.exit_code, stderr)
    }))
}

/// Qualify a failure with the path it concerns.
///
/// Raw service text is classified with the path blanked out, so a path such
/// as `/srv/credentials.json` never selects a category.
fn path_failure(action: &str, path: &str, err: Error) -> Error {
    let context = format!("Failed to {} '{}'", action, path);
    match err {
        Error::Remote(_) | Error::Io(_) => {
            let raw = err.to_string();
            let blanked = if path.is_empty() {
                raw.clone()
            } else {
                raw.replace(path, "<path>")
            };
            match classify(&context, &blanked) {
                Error::Generic(_) => Error::generic(format!("{}: {}", context, raw)),
                classified => classified,
            }
        }
        Error::Generic(msg) => Error::generic(format!("{}: {}", context, msg)),
        classified => classified,
    }
}

// =============================================================================
// Listing Parser
// =============================================================================

/// Parse `ls -la` output.
///
/// The first line (`total N`) is dropped, as are the `.` and `..` entries.
/// Unparseable sizes become 0 and unparseable dates become `now`.
pub fn parse_listing(output: &str, now: DateTime<Utc>) -> Vec<FileEntry> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| parse_listing_line(line, now))
        .collect()
}

fn parse_listing_line(line: &str, now: DateTime<Utc>) -> Option<FileEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let permissions = fields.first()?;

    let kind = if permissions.starts_with('d') {
        FileKind::Directory
    } else {
        FileKind::File
    };

    let size = fields.get(4).and_then(|s| s.parse().ok()).unwrap_or(0);

    let modified = fields
        .get(5..8)
        .and_then(|date| parse_timestamp(date, now))
        .unwrap_or(now);

    let mut name = fields.get(8..).map(|rest| rest.join(" ")).unwrap_or_default();
    if name.is_empty() {
        name = fields.last()?.to_string();
    }
    if permissions.starts_with('l') {
        if let Some((link, _target)) = name.split_once(" -> ") {
            name = link.to_string();
        }
    }

    if name == "." || name == ".." {
        return None;
    }

    Some(FileEntry {
        name,
        kind,
        size,
        modified,
    })
}

/// `Oct 19 08:03` (within the last six months) or `Oct 19 2024`.
fn parse_timestamp(date: &[&str], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let [month, day, last] = date else {
        return None;
    };

    if last.contains(':') {
        let raw = format!("{} {} {} {}", now.year(), month, day, last);
        let mut parsed = NaiveDateTime::parse_from_str(&raw, "%Y %b %d %H:%M").ok()?;
        // A clock time in the future belongs to the previous year.
        if parsed > now.naive_utc() + chrono::Duration::days(1) {
            parsed = parsed.with_year(now.year() - 1)?;
        }
        Some(parsed.and_utc())
    } else {
        let raw = format!("{} {} {}", last, month, day);
        let parsed = NaiveDate::parse_from_str(&raw, "%Y %b %d").ok()?;
        Some(parsed.and_hms_opt(0, 0, 0)?.and_utc())
    }
}
