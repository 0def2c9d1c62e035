//! Failure classification.
//!
//! Every boundary that talks to the remote service funnels raw failure text
//! through [`classify`]. The classifier only annotates: it does not retry and
//! does not log.

use crate::config::{TOKEN_ID_ENV, TOKEN_SECRET_ENV};
use crate::error::Error;

/// Substrings in interpreter stderr that mark a syntax error.
const SYNTAX_SIGNATURES: [&str; 2] = ["SyntaxError", "invalid syntax"];

/// Map raw failure text to a categorized, actionable error.
///
/// `context` names the operation that failed (e.g. `"Failed to create sandbox"`).
/// Auth and quota markers are matched case-insensitively.
pub fn classify(context: &str, raw: &str) -> Error {
    let lowered = raw.to_lowercase();

    if lowered.contains("unauthorized") || lowered.contains("credentials") {
        return Error::auth(format!(
            "{context}. Check that {TOKEN_ID_ENV} and {TOKEN_SECRET_ENV} \
             (or token_id and token_secret in the adapter config) are set and valid"
        ));
    }

    if lowered.contains("quota") || lowered.contains("limit") {
        return Error::quota(format!(
            "{context}. The sandbox service reported a usage limit; \
             check your usage and billing settings ({raw})"
        ));
    }

    if let Some(err) = syntax_failure(raw) {
        return err;
    }

    Error::generic(format!("{context}: {raw}"))
}

/// Classify an error value that may already carry a category.
///
/// Classified errors pass through untouched so a root cause is never
/// re-wrapped twice.
pub fn classify_error(context: &str, err: Error) -> Error {
    if err.is_classified() {
        err
    } else {
        classify(context, &err.to_string())
    }
}

/// Error for a session or resource lookup that returned nothing.
pub fn lookup_miss(what: &str, id: &str) -> Error {
    Error::not_found(format!("{what} '{id}' does not exist or is no longer available"))
}

/// Detect a syntax error in captured stderr.
pub fn syntax_failure(stderr: &str) -> Option<Error> {
    SYNTAX_SIGNATURES
        .iter()
        .any(|sig| stderr.contains(sig))
        .then(|| Error::syntax(stderr.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_auth_names_both_credentials() {
        let err = classify("Failed to create sandbox", "401 Unauthorized");
        assert_eq!(err.category(), ErrorCategory::Auth);
        let msg = err.to_string();
        assert!(msg.contains(TOKEN_ID_ENV));
        assert!(msg.contains(TOKEN_SECRET_ENV));

        let err = classify("Failed to create sandbox", "invalid credentials supplied");
        assert_eq!(err.category(), ErrorCategory::Auth);
    }

    #[test]
    fn test_quota() {
        let err = classify("Failed to create sandbox", "Quota exceeded for workspace");
        assert_eq!(err.category(), ErrorCategory::Quota);
        assert!(err.to_string().contains("billing"));

        let err = classify("Failed to create sandbox", "container limit reached");
        assert_eq!(err.category(), ErrorCategory::Quota);
    }

    #[test]
    fn test_syntax_echoes_trimmed_stderr() {
        let stderr = "  File \"<string>\", line 1\n    print(\nSyntaxError: '(' was never closed\n\n";
        let err = classify("Execution failed", stderr);
        assert_eq!(err.category(), ErrorCategory::Syntax);
        assert!(err.to_string().ends_with("SyntaxError: '(' was never closed"));

        assert!(syntax_failure("NameError: name 'x' is not defined").is_none());
        assert!(syntax_failure("E   invalid syntax").is_some());
    }

    #[test]
    fn test_generic_wraps_verbatim() {
        let err = classify("Failed to read file '/tmp/a'", "connection reset by peer");
        assert_eq!(err.category(), ErrorCategory::Generic);
        assert_eq!(
            err.to_string(),
            "Failed to read file '/tmp/a': connection reset by peer"
        );
    }

    #[test]
    fn test_lookup_miss_is_not_found() {
        let err = lookup_miss("Sandbox", "sb-123");
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(err.to_string().contains("sb-123"));
    }

    #[test]
    fn test_classified_errors_pass_through() {
        let original = Error::not_found("port 3000");
        let err = classify_error("Failed to get url", original);
        assert_eq!(err.to_string(), "Not found: port 3000");

        let err = classify_error("Failed to spawn", Error::remote("quota reached"));
        assert_eq!(err.category(), ErrorCategory::Quota);
    }
}
