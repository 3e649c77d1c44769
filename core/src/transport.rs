//! Sandbox transport traits.
//!
//! Provisioning and connecting to sandboxes is owned by an external provider.
//! This module only names the capabilities the command store and the
//! orchestrator need from it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Minimal filesystem surface against a sandbox's persistent storage.
///
/// `read_file` must return `Ok(None)` when the path does not exist and
/// reserve `Err` for every other failure. The store relies on that split to
/// tell "first call" apart from a broken sandbox.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Writes `data` to `path`, replacing any existing content.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Reads the full content of `path`, or `None` if it does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Creates `path` and all missing parents. Existing directories are fine.
    async fn make_dir_all(&self, path: &str) -> Result<()>;
}

/// A live connection to one sandbox.
#[async_trait]
pub trait SandboxSession: RemoteFs {
    /// Returns the id of the connected sandbox.
    fn sandbox_id(&self) -> &str;

    /// Runs a command to completion and captures its output.
    ///
    /// Argument quoting is the transport's concern.
    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput>;

    /// Starts a command in the background and returns its process id.
    async fn start(&self, command: &str, args: &[String]) -> Result<u32>;

    /// Reattaches to a process started with [`SandboxSession::start`] and
    /// waits for it to exit.
    async fn wait(&self, pid: u32) -> Result<CommandOutput>;
}

/// Connects to externally managed sandboxes by id.
#[async_trait]
pub trait SandboxConnector: Send + Sync {
    /// The session type this connector produces.
    type Session: SandboxSession + 'static;

    /// Connects to an existing sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<Self::Session>;
}
