//! Runtime detection from source text.
//!
//! Pure substring matching, first match wins: Node markers are checked before
//! Python markers, and text with neither runs under [`DEFAULT_RUNTIME`]. The
//! code is never parsed or executed here.

use skiff_core::RuntimeTag;

/// Runtime used when no marker matches.
pub const DEFAULT_RUNTIME: RuntimeTag = RuntimeTag::Node;

const NODE_MARKERS: &[&str] = &[
    "console.log",
    "console.error",
    "process.",
    "require(",
    "module.exports",
    "exports.",
    "throw new Error",
];

const PYTHON_MARKERS: &[&str] = &[
    "print(",
    "import ",
    "def ",
    "raise ",
    "f\"",
    "f'",
    "sys.",
    "__name__",
];

/// Detect the runtime a piece of code is written for.
pub fn detect(code: &str) -> RuntimeTag {
    if contains_any(code, NODE_MARKERS) {
        RuntimeTag::Node
    } else if contains_any(code, PYTHON_MARKERS) {
        RuntimeTag::Python
    } else {
        DEFAULT_RUNTIME
    }
}

/// Explicit runtime if given, otherwise the detected one.
pub fn resolve(code: &str, explicit: Option<RuntimeTag>) -> RuntimeTag {
    explicit.unwrap_or_else(|| detect(code))
}

fn contains_any(code: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| code.contains(marker))
}
