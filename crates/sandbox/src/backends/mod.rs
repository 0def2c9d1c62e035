//! Capability implementations.

pub mod docker;
pub mod local;
pub mod mock;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;
pub use mock::{ExecRecord, MockResponse, MockSandbox};
