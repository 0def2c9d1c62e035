//! Per-operation failure policy.
//!
//! Some operations surface every failure to the caller, others are
//! best-effort and settle on a safe default. The table lives here so the
//! asymmetry can be audited in one place and asserted in tests.

use crate::error::{Error, Result};

/// Operations exposed by the sandbox contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Reconnect,
    Destroy,
    GetInfo,
    GetUrl,
    RunCode,
    RunCommand,
    ReadFile,
    WriteFile,
    Mkdir,
    Readdir,
    Exists,
    Remove,
}

/// What happens to a failure inside an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the classified error to the caller.
    Surface,
    /// Replace the error with the operation's default value.
    Swallow,
}

impl Operation {
    pub const ALL: [Operation; 13] = [
        Operation::Create,
        Operation::Reconnect,
        Operation::Destroy,
        Operation::GetInfo,
        Operation::GetUrl,
        Operation::RunCode,
        Operation::RunCommand,
        Operation::ReadFile,
        Operation::WriteFile,
        Operation::Mkdir,
        Operation::Readdir,
        Operation::Exists,
        Operation::Remove,
    ];

    pub const fn failure_policy(self) -> FailurePolicy {
        match self {
            // reconnect -> None, destroy -> no-op, get_info -> running,
            // run_command -> exit 127 result, exists -> false
            Operation::Reconnect
            | Operation::Destroy
            | Operation::GetInfo
            | Operation::RunCommand
            | Operation::Exists => FailurePolicy::Swallow,
            Operation::Create
            | Operation::GetUrl
            | Operation::RunCode
            | Operation::ReadFile
            | Operation::WriteFile
            | Operation::Mkdir
            | Operation::Readdir
            | Operation::Remove => FailurePolicy::Surface,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Reconnect => "reconnect",
            Operation::Destroy => "destroy",
            Operation::GetInfo => "get_info",
            Operation::GetUrl => "get_url",
            Operation::RunCode => "run_code",
            Operation::RunCommand => "run_command",
            Operation::ReadFile => "read_file",
            Operation::WriteFile => "write_file",
            Operation::Mkdir => "mkdir",
            Operation::Readdir => "readdir",
            Operation::Exists => "exists",
            Operation::Remove => "remove",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Apply `op`'s failure policy to an outcome.
///
/// For swallowing operations the error is turned into a value by `default`;
/// surfacing operations return the error unchanged.
pub fn settle<T>(op: Operation, outcome: Result<T>, default: impl FnOnce(Error) -> T) -> Result<T> {
    match outcome {
        Ok(value) => Ok(value),
        Err(err) => match op.failure_policy() {
            FailurePolicy::Swallow => Ok(default(err)),
            FailurePolicy::Surface => Err(err),
        },
    }
}
