#![deny(unused)]
//! skiff - remote execution sandboxes from the command line.
//!
//! Usage:
//!   skiff create --runtime python --port 8080
//!   skiff run -- ls -la /tmp               # ephemeral sandbox
//!   skiff code --sandbox <id> "print(1)"
//!   skiff url <id> 8080 --protocol wss
//!   skiff ls
//!   skiff destroy <id>

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use skiff_core::config::AdapterConfig;
use skiff_core::telemetry::configure_tracing;
use skiff_core::{CommandOptions, CreateOptions, RuntimeTag};
use skiff_sandbox::capability::SandboxService;
use skiff_sandbox::engine::shell_escape;
use skiff_sandbox::{DockerSandbox, LocalSandbox, Sandbox, SandboxProvider};

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    version,
    about = "Remote execution sandboxes: run code, shell commands and file operations"
)]
struct Cli {
    /// Sandbox backend
    #[arg(long, value_enum, default_value = "docker", env = "SKIFF_BACKEND")]
    backend: Backend,

    /// Emit logs as JSON lines on stderr
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Docker,
    Local,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a sandbox and print its info
    Create {
        #[arg(long)]
        runtime: Option<RuntimeTag>,

        #[arg(long)]
        image: Option<String>,

        /// Port to expose (repeatable)
        #[arg(long = "port")]
        ports: Vec<u16>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run a shell command
    Run {
        /// Existing sandbox; a temporary one is used when omitted
        #[arg(long)]
        sandbox: Option<String>,

        #[arg(long)]
        cwd: Option<String>,

        /// KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        #[arg(long)]
        background: bool,

        /// A single argument runs as a shell script; several are quoted as argv
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run a code snippet
    Code {
        /// Existing sandbox; a temporary one is used when omitted
        #[arg(long)]
        sandbox: Option<String>,

        /// Runtime to use instead of detection
        #[arg(long)]
        runtime: Option<RuntimeTag>,

        code: String,
    },

    /// Print info for a sandbox
    Info { id: String },

    /// Print the public URL for an exposed port
    Url {
        id: String,

        port: u16,

        /// Scheme override, e.g. wss
        #[arg(long)]
        protocol: Option<String>,
    },

    /// List live sandboxes
    Ls,

    /// Destroy a sandbox
    Destroy { id: String },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

/// `sh -c` text for the trailing arguments of `run`.
fn command_line(args: &[String]) -> String {
    match args {
        [script] => script.clone(),
        _ => args
            .iter()
            .map(|arg| shell_escape(arg))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// An existing sandbox, or a temporary one destroyed after use.
async fn acquire(
    provider: &SandboxProvider,
    id: Option<&str>,
    runtime: Option<RuntimeTag>,
) -> anyhow::Result<(Sandbox, bool)> {
    match id {
        Some(id) => {
            let sandbox = provider
                .create(&CreateOptions::reconnect(id))
                .await
                .with_context(|| format!("sandbox {}", id))?;
            Ok((sandbox, false))
        }
        None => {
            let options = CreateOptions {
                runtime,
                ..Default::default()
            };
            Ok((provider.create(&options).await?, true))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_tracing(cli.json_logs)?;

    let config = AdapterConfig::load().context("Failed to load configuration")?;
    let service: Arc<dyn SandboxService> = match cli.backend {
        Backend::Docker => Arc::new(DockerSandbox::new()?),
        Backend::Local => Arc::new(LocalSandbox::new()),
    };
    let provider = SandboxProvider::new(service, config);

    tracing::debug!(backend = %provider.name(), "Provider ready");

    match cli.command {
        Commands::Create {
            runtime,
            image,
            ports,
            timeout_ms,
        } => {
            let options = CreateOptions {
                runtime,
                image,
                ports: (!ports.is_empty()).then_some(ports),
                timeout_ms,
                ..Default::default()
            };
            let sandbox = provider.create(&options).await?;
            print_json(&sandbox.get_info().await)?;
        }

        Commands::Run {
            sandbox,
            cwd,
            env,
            background,
            command,
        } => {
            let (sandbox, temporary) = acquire(&provider, sandbox.as_deref(), None).await?;
            let options = CommandOptions {
                env: env.into_iter().collect::<HashMap<_, _>>(),
                cwd,
                background,
            };
            let result = sandbox.run_command(&command_line(&command), &options).await;
            if temporary {
                sandbox.destroy().await;
            }
            print_json(&result)?;
            if !result.success() {
                std::process::exit(i32::try_from(result.exit_code).unwrap_or(1));
            }
        }

        Commands::Code {
            sandbox,
            runtime,
            code,
        } => {
            let (sandbox, temporary) = acquire(&provider, sandbox.as_deref(), runtime).await?;
            let outcome = sandbox.run_code(&code, runtime).await;
            if temporary {
                sandbox.destroy().await;
            }
            let result = outcome?;
            print_json(&result)?;
            if !result.success() {
                std::process::exit(i32::try_from(result.exit_code).unwrap_or(1));
            }
        }

        Commands::Info { id } => {
            let sandbox = provider
                .get_by_id(&id)
                .await
                .with_context(|| format!("Sandbox '{}' not found", id))?;
            print_json(&sandbox.get_info().await)?;
        }

        Commands::Url { id, port, protocol } => {
            let sandbox = provider
                .get_by_id(&id)
                .await
                .with_context(|| format!("Sandbox '{}' not found", id))?;
            let url = sandbox.get_url(port, protocol.as_deref()).await?;
            print_json(&json!({ "id": id, "port": port, "url": url }))?;
        }

        Commands::Ls => {
            print_json(&provider.list().await?)?;
        }

        Commands::Destroy { id } => {
            provider.destroy(&id).await;
            print_json(&json!({ "id": id, "destroyed": true }))?;
        }
    }

    Ok(())
}
