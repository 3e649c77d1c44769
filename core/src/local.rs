//! Host-directory sandbox transport.
//!
//! Each sandbox id names a directory under a base dir. Sandbox paths are
//! re-rooted into that directory and commands run on the host with it as
//! the working directory. This provides no isolation; it exists so the
//! command lifecycle can be driven without a remote provider.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{Error, ProviderError, Result};
use crate::transport::{CommandOutput, RemoteFs, SandboxConnector, SandboxSession};

type ProcessTable = Arc<Mutex<HashMap<u32, JoinHandle<std::io::Result<Output>>>>>;

/// Connector whose sandboxes are directories under `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    base_dir: PathBuf,
    processes: ProcessTable,
}

impl LocalConnector {
    /// Creates a connector rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the base directory holding all sandboxes.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Creates the directory backing `sandbox_id`.
    pub async fn create_sandbox(&self, sandbox_id: &str) -> Result<PathBuf> {
        let dir = self.sandbox_dir(sandbox_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!(sandbox_id = %sandbox_id, dir = ?dir, "local sandbox created");
        Ok(dir)
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> Result<PathBuf> {
        let valid = !sandbox_id.is_empty()
            && sandbox_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Connection(ProviderError::new(format!(
                "invalid sandbox id: {:?}",
                sandbox_id
            ))));
        }
        Ok(self.base_dir.join(sandbox_id))
    }
}

#[async_trait]
impl SandboxConnector for LocalConnector {
    type Session = LocalSession;

    async fn connect(&self, sandbox_id: &str) -> Result<LocalSession> {
        let dir = self.sandbox_dir(sandbox_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(LocalSession {
                sandbox_id: sandbox_id.to_string(),
                dir,
                processes: Arc::clone(&self.processes),
            }),
            Ok(_) => Err(Error::Connection(ProviderError::new(format!(
                "sandbox {} is not a directory",
                sandbox_id
            )))),
            Err(e) => Err(Error::Connection(ProviderError::new(format!(
                "sandbox {} unavailable: {}",
                sandbox_id, e
            )))),
        }
    }
}

/// A connection to one local sandbox directory.
#[derive(Debug)]
pub struct LocalSession {
    sandbox_id: String,
    dir: PathBuf,
    processes: ProcessTable,
}

impl LocalSession {
    /// Maps an in-sandbox path onto the host, refusing `..` escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(Error::Storage(ProviderError::new(format!(
                        "path escapes sandbox: {}",
                        path
                    ))))
                }
            }
        }
        Ok(resolved)
    }

    fn command(&self, command: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn storage_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Storage(ProviderError::new(format!("{} {}: {}", action, path.display(), e)))
}

fn to_output(output: Output) -> CommandOutput {
    CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        // Killed by a signal: no code.
        exit_code: output.status.code().unwrap_or(-1),
    }
}

#[async_trait]
impl RemoteFs for LocalSession {
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("mkdir", parent, e))?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|e| storage_error("write", &target, e))
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", &target, e)),
        }
    }

    async fn make_dir_all(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| storage_error("mkdir", &target, e))
    }
}

#[async_trait]
impl SandboxSession for LocalSession {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput> {
        tracing::info!(sandbox_id = %self.sandbox_id, command = %command, "running command");
        let output = self
            .command(command, args)
            .output()
            .await
            .map_err(|e| Error::Execution(ProviderError::new(format!("failed to run {}: {}", command, e))))?;
        let output = to_output(output);
        tracing::info!(
            sandbox_id = %self.sandbox_id,
            command = %command,
            exit_code = output.exit_code,
            "command finished"
        );
        Ok(output)
    }

    async fn start(&self, command: &str, args: &[String]) -> Result<u32> {
        let child = self
            .command(command, args)
            .spawn()
            .map_err(|e| Error::Execution(ProviderError::new(format!("failed to start {}: {}", command, e))))?;
        let pid = child.id().ok_or_else(|| {
            Error::Execution(ProviderError::new(format!("{} exited before reporting a pid", command)))
        })?;

        let handle = tokio::spawn(child.wait_with_output());
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, handle);

        tracing::info!(
            sandbox_id = %self.sandbox_id,
            command = %command,
            pid,
            "background command started"
        );
        Ok(pid)
    }

    async fn wait(&self, pid: u32) -> Result<CommandOutput> {
        let handle = self
            .processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid)
            .ok_or_else(|| Error::Execution(ProviderError::new(format!("no process with pid {}", pid))))?;

        let output = handle
            .await
            .map_err(|e| Error::Execution(ProviderError::new(format!("wait task for pid {} failed: {}", pid, e))))?
            .map_err(|e| Error::Execution(ProviderError::new(format!("wait for pid {} failed: {}", pid, e))))?;
        Ok(to_output(output))
    }
}
