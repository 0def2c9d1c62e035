#![deny(unused)]
//! Remote execution sandbox adapter.
//!
//! Exposes one contract (create, run code, run shell commands, manage files,
//! fetch tunnel URLs, destroy) over a managed sandbox service that is only
//! reachable through its own SDK. The service is consumed through the
//! capability traits in [`capability`]; each backend implements them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  SandboxProvider / Sandbox (facade)    │
//! ├──────────────┬──────────────┬──────────┤
//! │  Lifecycle   │  Engine      │  Files   │
//! │  create/info │  code/shell  │  api+sh  │
//! ├──────────────┴──────────────┴──────────┤
//! │  Capability traits (Session, Process)  │
//! ├────────────────────────────────────────┤
//! │  Backends: Docker · local · mock       │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use skiff_sandbox::{DockerSandbox, SandboxProvider};
//! use skiff_core::{config::AdapterConfig, CommandOptions, CreateOptions};
//!
//! let provider = SandboxProvider::new(Arc::new(DockerSandbox::new()?), AdapterConfig::load()?);
//! let sandbox = provider.create(&CreateOptions::default()).await?;
//!
//! let result = sandbox.run_code("print('hi')", None).await?;
//! sandbox.fs().write_file("/tmp/a.txt", "hello").await?;
//! let ls = sandbox.run_command("ls /tmp", &CommandOptions::default()).await;
//!
//! sandbox.destroy().await;
//! ```

pub mod backends;
pub mod capability;
pub mod engine;
pub mod fs;
pub mod lifecycle;
pub mod provider;
pub mod runtime;

pub use backends::{DockerSandbox, LocalSandbox, MockResponse, MockSandbox};
pub use fs::Filesystem;
pub use lifecycle::{LifecycleManager, SandboxHandle};
pub use provider::{Sandbox, SandboxProvider};
