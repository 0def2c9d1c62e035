//! Sandbox integration tests.
//!
//! Tests the full pipeline: SandboxProvider → LifecycleManager / engine /
//! filesystem → capability traits (MockSandbox). These tests do NOT require
//! Docker: MockSandbox gives deterministic behavior.

use secrecy::Secret;
use std::collections::HashMap;
use std::sync::Arc;

use skiff_core::config::AdapterConfig;
use skiff_core::{
    CommandOptions, CreateOptions, ErrorCategory, FileKind, RuntimeTag, SandboxStatus,
};
use skiff_sandbox::{MockResponse, MockSandbox, Sandbox, SandboxProvider};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> AdapterConfig {
    AdapterConfig {
        token_id: Some("tok-id".into()),
        token_secret: Some(Secret::new("tok-secret".into())),
        ..Default::default()
    }
}

fn provider(mock: &MockSandbox) -> SandboxProvider {
    SandboxProvider::new(Arc::new(mock.clone()), config())
}

async fn sandbox(mock: &MockSandbox) -> (SandboxProvider, Sandbox) {
    let provider = provider(mock);
    let sandbox = provider.create(&CreateOptions::default()).await.unwrap();
    (provider, sandbox)
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// 1. Lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_uses_configured_defaults() {
    let mock = MockSandbox::default();
    let (_provider, sandbox) = sandbox(&mock).await;

    assert_eq!(sandbox.runtime(), RuntimeTag::Node);
    let info = sandbox.get_info().await;
    assert_eq!(info.id, sandbox.id());
    assert_eq!(info.provider, "mock");
    assert_eq!(info.status, SandboxStatus::Running);
    assert_eq!(info.metadata.get("app").unwrap(), "skiff-sandbox");
    assert_eq!(info.metadata.get("image").unwrap(), "node:20-slim");
    assert_eq!(mock.spawn_count(), 1);
}

#[tokio::test]
async fn test_create_with_options() {
    let mock = MockSandbox::default();
    let provider = provider(&mock);
    let options = CreateOptions {
        runtime: Some(RuntimeTag::Python),
        timeout_ms: Some(60_000),
        metadata: HashMap::from([("team".to_string(), "infra".to_string())]),
        ..Default::default()
    };
    let sandbox = provider.create(&options).await.unwrap();

    let info = sandbox.get_info().await;
    assert_eq!(info.runtime, RuntimeTag::Python);
    assert_eq!(info.timeout_ms, Some(60_000));
    assert_eq!(info.metadata.get("team").unwrap(), "infra");
    assert_eq!(info.metadata.get("image").unwrap(), "python:3.12-slim");
}

#[tokio::test]
async fn test_missing_credentials_fail_before_any_call() {
    let mock = MockSandbox::default();
    let provider = SandboxProvider::new(Arc::new(mock.clone()), AdapterConfig::default());

    if std::env::var("SKIFF_TOKEN_ID").is_ok() {
        return;
    }

    let err = provider.create(&CreateOptions::default()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Auth);
    assert!(err.to_string().contains("SKIFF_TOKEN_ID"));
    assert_eq!(mock.spawn_count(), 0);
}

#[tokio::test]
async fn test_provisioning_failures_are_classified() {
    let mock = MockSandbox::default();
    mock.fail_spawns_with("Quota exceeded: 10 concurrent sandboxes")
        .await;
    let err = provider(&mock)
        .create(&CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Quota);

    let mock = MockSandbox::default();
    mock.require_token("tok-id", "another-secret").await;
    let err = provider(&mock)
        .create(&CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Auth);
    assert!(err.to_string().contains("SKIFF_TOKEN_SECRET"));
}

#[tokio::test]
async fn test_create_with_sandbox_id_reconnects() {
    let mock = MockSandbox::default();
    let (provider, original) = sandbox(&mock).await;

    let again = provider
        .create(&CreateOptions::reconnect(original.id()))
        .await
        .unwrap();
    assert_eq!(again.id(), original.id());
    assert_eq!(mock.spawn_count(), 1);

    let err = provider
        .create(&CreateOptions::reconnect("does-not-exist"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert!(err.to_string().contains("does-not-exist"));
}

#[tokio::test]
async fn test_reconnect_unknown_id_is_none() {
    let mock = MockSandbox::default();
    let provider = provider(&mock);
    assert!(provider.get_by_id("nope").await.is_none());

    let (_p, sandbox) = self::sandbox(&mock).await;
    mock.fail_lookups_with("service unavailable").await;
    assert!(provider.get_by_id(sandbox.id()).await.is_none());
}

#[tokio::test]
async fn test_destroy_twice_is_noop() {
    let mock = MockSandbox::default();
    let (provider, sandbox) = sandbox(&mock).await;
    let id = sandbox.id().to_string();

    provider.destroy(&id).await;
    provider.destroy(&id).await;
    sandbox.destroy().await;

    assert_eq!(mock.terminate_count(), 1);
    assert!(provider.get_by_id(&id).await.is_none());
    assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_info_reports_running_when_poll_fails() {
    let mock = MockSandbox::default();
    let (_provider, sandbox) = sandbox(&mock).await;
    mock.fail_polls_with("connection reset").await;
    assert_eq!(sandbox.get_info().await.status, SandboxStatus::Running);
}

#[tokio::test]
async fn test_list_and_availability() {
    let mock = MockSandbox::default();
    let provider = provider(&mock);
    let a = provider.create(&CreateOptions::default()).await.unwrap();
    let b = provider.create(&CreateOptions::default()).await.unwrap();

    let mut expected = vec![a.id().to_string(), b.id().to_string()];
    expected.sort();
    assert_eq!(provider.list().await.unwrap(), expected);
    assert!(provider.is_available().await);
    assert_eq!(provider.name(), "mock");
}

// =============================================================================
// 2. Tunnels
// =============================================================================

#[tokio::test]
async fn test_get_url() {
    let mock = MockSandbox::default();
    let provider = provider(&mock);
    let options = CreateOptions {
        ports: Some(vec![8080, 3000]),
        ..Default::default()
    };
    let sandbox = provider.create(&options).await.unwrap();

    let url = sandbox.get_url(3000, None).await.unwrap();
    assert!(url.starts_with("https://"));
    assert!(url.contains("-3000."));

    let ws = sandbox.get_url(3000, Some("wss")).await.unwrap();
    assert_eq!(ws, url.replacen("https://", "wss://", 1));

    let err = sandbox.get_url(9999, None).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert!(err.to_string().contains("3000, 8080"));
}

#[tokio::test]
async fn test_get_url_without_ports() {
    let mock = MockSandbox::default();
    let (_provider, sandbox) = sandbox(&mock).await;
    let err = sandbox.get_url(80, None).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert!(err.to_string().contains("no ports"));
}

// =============================================================================
// 3. Code execution
// =============================================================================

#[tokio::test]
async fn test_run_code_reuses_matching_session() {
    let mock = MockSandbox::new(vec![MockResponse::stdout("3\n")]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let result = sandbox.run_code("console.log(1 + 2)", None).await.unwrap();
    assert_eq!(result.stdout, "3\n");
    assert_eq!(result.exit_code, 0);

    let executed = mock.executed().await;
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].session_id, sandbox.id());
    assert_eq!(executed[0].argv, argv(&["node", "-e", "console.log(1 + 2)"]));
    assert_eq!(mock.spawn_count(), 1);
}

#[tokio::test]
async fn test_run_code_other_runtime_uses_auxiliary_session() {
    let mock = MockSandbox::new(vec![MockResponse::stdout("hi\n")]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let result = sandbox.run_code("print('hi')", None).await.unwrap();
    assert_eq!(result.stdout, "hi\n");

    let executed = mock.executed().await;
    assert_eq!(executed[0].argv, argv(&["python3", "-c", "print('hi')"]));
    assert_ne!(executed[0].session_id, sandbox.id());

    assert_eq!(mock.spawn_count(), 2);
    assert_eq!(mock.terminate_count(), 1);
    assert_eq!(mock.live_sessions().await, vec![sandbox.id().to_string()]);
}

#[tokio::test]
async fn test_auxiliary_session_torn_down_on_failure() {
    let mock = MockSandbox::new(vec![MockResponse::ExecError("stream closed".into())]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let err = sandbox
        .run_code("x = 1", Some(RuntimeTag::Python))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Generic);
    assert!(err.to_string().contains("Failed to execute code"));
    assert_eq!(mock.terminate_count(), 1);
}

#[tokio::test]
async fn test_python_syntax_error() {
    let stderr = "  File \"<string>\", line 1\n    print(\n         ^\nSyntaxError: '(' was never closed\n";
    let mock = MockSandbox::new(vec![MockResponse::failure(stderr, 1)]);
    let provider = provider(&mock);
    let sandbox = provider
        .create(&CreateOptions {
            runtime: Some(RuntimeTag::Python),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = sandbox.run_code("print(", None).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Syntax);
    assert!(err.to_string().contains("was never closed"));
}

#[tokio::test]
async fn test_explicit_python_syntax_error_on_node_sandbox() {
    let stderr = "  File \"<string>\", line 1\n    def broken(:\n               ^\nSyntaxError: invalid syntax\n";
    let mock = MockSandbox::new(vec![MockResponse::failure(stderr, 1)]);
    let (_provider, sandbox) = sandbox(&mock).await;
    assert_eq!(sandbox.runtime(), RuntimeTag::Node);

    let err = sandbox
        .run_code("def broken(:", Some(RuntimeTag::Python))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Syntax);
    assert!(err.to_string().contains("invalid syntax"));

    let executed = mock.executed().await;
    assert_eq!(executed[0].argv, argv(&["python3", "-c", "def broken(:"]));
    assert_ne!(executed[0].session_id, sandbox.id());
    assert_eq!(mock.terminate_count(), 1);
}

#[tokio::test]
async fn test_nonzero_exit_is_data() {
    let mock = MockSandbox::new(vec![MockResponse::failure("Error: boom", 3)]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let result = sandbox
        .run_code("process.exit(3)", None)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr, "Error: boom");
    assert!(!result.success());
}

#[tokio::test]
async fn test_missing_exit_status_counts_as_success() {
    let mock = MockSandbox::new(vec![MockResponse::Output {
        stdout: "ok".into(),
        stderr: String::new(),
        exit_code: None,
    }]);
    let (_provider, sandbox) = sandbox(&mock).await;
    let result = sandbox.run_code("console.log('ok')", None).await.unwrap();
    assert_eq!(result.exit_code, 0);
}

// =============================================================================
// 4. Shell commands
// =============================================================================

#[tokio::test]
async fn test_run_command_composes_options() {
    let mock = MockSandbox::new(vec![MockResponse::stdout("/srv\n")]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let options = CommandOptions {
        env: HashMap::from([("MODE".to_string(), "prod".to_string())]),
        cwd: Some("/srv".into()),
        background: false,
    };
    let result = sandbox.run_command("pwd", &options).await;
    assert_eq!(result.stdout, "/srv\n");

    let executed = mock.executed().await;
    assert_eq!(
        executed[0].argv,
        argv(&["sh", "-c", "cd '/srv' && export MODE='prod' && pwd"])
    );
}

#[tokio::test]
async fn test_run_command_never_errors() {
    let mock = MockSandbox::new(vec![MockResponse::ExecError("connection dropped".into())]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let result = sandbox.run_command("ls", &CommandOptions::default()).await;
    assert_eq!(result.exit_code, 127);
    assert_eq!(result.stdout, "");
    assert!(result.stderr.contains("connection dropped"));
}

#[tokio::test]
async fn test_run_command_rejects_bad_env_name_as_result() {
    let mock = MockSandbox::default();
    let (_provider, sandbox) = sandbox(&mock).await;

    let options = CommandOptions {
        env: HashMap::from([("BAD NAME".to_string(), "1".to_string())]),
        ..Default::default()
    };
    let result = sandbox.run_command("true", &options).await;
    assert_eq!(result.exit_code, 127);
    assert!(mock.executed().await.is_empty());
}

// =============================================================================
// 5. Filesystem
// =============================================================================

#[tokio::test]
async fn test_read_file_prefers_file_api() {
    let mock = MockSandbox::default();
    mock.put_file("/data/a.txt", b"from api").await;
    let (_provider, sandbox) = sandbox(&mock).await;

    assert_eq!(sandbox.fs().read_file("/data/a.txt").await.unwrap(), "from api");
    assert!(mock.executed().await.is_empty());
}

#[tokio::test]
async fn test_read_file_falls_back_to_cat() {
    let mock = MockSandbox::new(vec![MockResponse::stdout("from cat")]);
    mock.disable_file_api();
    let (_provider, sandbox) = sandbox(&mock).await;

    assert_eq!(sandbox.fs().read_file("/data/a.txt").await.unwrap(), "from cat");
    assert_eq!(mock.executed().await[0].argv, argv(&["cat", "/data/a.txt"]));
}

#[tokio::test]
async fn test_dual_failure_reports_first_error() {
    let mock = MockSandbox::new(vec![MockResponse::failure("cat: /data/x.txt: No such file", 1)]);
    mock.disable_file_api();
    let (_provider, sandbox) = sandbox(&mock).await;

    let err = sandbox.fs().read_file("/data/x.txt").await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("/data/x.txt"));
    assert!(msg.contains("file API unavailable"));
    assert!(!msg.contains("cat:"));
}

#[tokio::test]
async fn test_keyword_paths_keep_generic_category() {
    let mock = MockSandbox::new(vec![
        MockResponse::failure("cat: /srv/app/credentials.json: No such file or directory", 1),
        MockResponse::failure(
            "mkdir: cannot create directory '/data/rate-limits': Permission denied",
            1,
        ),
    ]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let err = sandbox
        .fs()
        .read_file("/srv/app/credentials.json")
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Generic);
    assert!(err.to_string().contains("No such file"));
    assert!(!err.to_string().contains("SKIFF_TOKEN_ID"));

    let err = sandbox.fs().mkdir("/data/rate-limits").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Generic);
    assert!(err.to_string().contains("Permission denied"));
    assert!(!err.to_string().contains("billing"));
}

#[tokio::test]
async fn test_write_file_primary_and_fallback() {
    let mock = MockSandbox::default();
    let (_provider, sandbox) = sandbox(&mock).await;
    sandbox.fs().write_file("/tmp/a.txt", "hello").await.unwrap();
    assert_eq!(mock.file("/tmp/a.txt").await.unwrap(), b"hello");
    assert!(mock.executed().await.is_empty());

    mock.disable_file_api();
    sandbox.fs().write_file("/tmp/a b.txt", "it's").await.unwrap();
    assert_eq!(
        mock.executed().await[0].argv,
        argv(&["sh", "-c", "printf '%s' 'it'\\''s' > '/tmp/a b.txt'"])
    );
}

#[tokio::test]
async fn test_exists_swallows_failures() {
    let mock = MockSandbox::new(vec![
        MockResponse::stdout(""),
        MockResponse::failure("", 1),
        MockResponse::ExecError("session gone".into()),
    ]);
    let (_provider, sandbox) = sandbox(&mock).await;

    assert!(sandbox.fs().exists("/etc").await);
    assert!(!sandbox.fs().exists("/missing").await);
    assert!(!sandbox.fs().exists("/whatever").await);
    assert_eq!(mock.executed().await[0].argv, argv(&["test", "-e", "/etc"]));
}

#[tokio::test]
async fn test_readdir_parses_listing() {
    let listing = "total 8\n\
drwxr-xr-x 2 root root 4096 Jan  5 10:00 .\n\
drwxr-xr-x 9 root root 4096 Jan  5 10:00 ..\n\
-rw-r--r-- 1 root root   12 Jan  5 10:00 hello.txt\n\
drwxr-xr-x 2 root root 4096 Jan  5 10:00 lib\n";
    let mock = MockSandbox::new(vec![MockResponse::stdout(listing)]);
    let (_provider, sandbox) = sandbox(&mock).await;

    let entries = sandbox.fs().readdir("/app").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "hello.txt");
    assert_eq!(entries[0].kind, FileKind::File);
    assert_eq!(entries[0].size, 12);
    assert_eq!(entries[1].kind, FileKind::Directory);
    assert_eq!(mock.executed().await[0].argv, argv(&["ls", "-la", "/app"]));
}

#[tokio::test]
async fn test_mkdir_and_remove_surface_path_errors() {
    let mock = MockSandbox::new(vec![
        MockResponse::stdout(""),
        MockResponse::failure("mkdir: cannot create directory '/root/x': Permission denied", 1),
        MockResponse::stdout(""),
    ]);
    let (_provider, sandbox) = sandbox(&mock).await;

    sandbox.fs().mkdir("/tmp/new/dir").await.unwrap();
    let err = sandbox.fs().mkdir("/root/x").await.unwrap_err();
    assert!(err.to_string().contains("'/root/x'"));
    assert!(err.to_string().contains("Permission denied"));
    sandbox.fs().remove("/tmp/new").await.unwrap();

    let executed = mock.executed().await;
    assert_eq!(executed[0].argv, argv(&["mkdir", "-p", "/tmp/new/dir"]));
    assert_eq!(executed[2].argv, argv(&["rm", "-rf", "/tmp/new"]));
}
