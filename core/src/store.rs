//! Command artifact store.
//!
//! Each command owns two files inside the sandbox:
//!
//! ```text
//! <root>/cmds/<cmdId>/meta.json     one CommandRecord
//! <root>/cmds/<cmdId>/logs.ndjson   newline-delimited LogLine records
//! ```
//!
//! There is no lock around these files. Writers merge into `meta.json` by
//! read-modify-write, so two overlapping calls on the same command can lose
//! one update (last writer wins). Callers are expected to attach optional
//! fields from temporally separated calls: one interactive attach, one
//! worker attach.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::error::{Error, Result};
use crate::ids::is_command_id;
use crate::record::{now_millis, render_log, CommandRecord};
use crate::transport::{RemoteFs, SandboxConnector};

/// Default namespace root inside the sandbox.
pub const DEFAULT_ROOT: &str = "/tmp/vibe-coding-platform";

/// Optional fields attached on [`CommandStore::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    pub trigger_run_id: Option<String>,
    pub pid: Option<u32>,
}

impl InitOptions {
    /// Attach a delegated worker run id.
    pub fn with_trigger_run_id(mut self, id: impl Into<String>) -> Self {
        self.trigger_run_id = Some(id.into());
        self
    }

    /// Attach a background process id.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    fn is_empty(&self) -> bool {
        self.trigger_run_id.is_none() && self.pid.is_none()
    }
}

/// On-sandbox locations of one command's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPaths {
    pub dir: String,
    pub meta: String,
    pub logs: String,
}

/// Reads and writes command artifacts through a [`SandboxConnector`].
pub struct CommandStore<C: SandboxConnector> {
    connector: Arc<C>,
    root: String,
}

impl<C: SandboxConnector> Clone for CommandStore<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            root: self.root.clone(),
        }
    }
}

impl<C: SandboxConnector> CommandStore<C> {
    /// Creates a store rooted at [`DEFAULT_ROOT`].
    pub fn new(connector: Arc<C>) -> Self {
        Self::with_root(connector, DEFAULT_ROOT)
    }

    /// Creates a store rooted at a custom namespace path.
    pub fn with_root(connector: Arc<C>, root: impl Into<String>) -> Self {
        let root = root.into();
        let trimmed = root.trim_end_matches('/');
        Self {
            connector,
            root: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
        }
    }

    /// Returns the connector used to reach sandboxes.
    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// Returns the namespace root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Returns the artifact paths for `cmd_id`.
    pub fn paths(&self, cmd_id: &str) -> Result<CommandPaths> {
        if !is_command_id(cmd_id) {
            return Err(Error::Config(format!("invalid command id: {:?}", cmd_id)));
        }
        let base = if self.root == "/" { "" } else { self.root.as_str() };
        let dir = format!("{}/cmds/{}", base, cmd_id);
        Ok(CommandPaths {
            meta: format!("{}/meta.json", dir),
            logs: format!("{}/logs.ndjson", dir),
            dir,
        })
    }

    /// Creates or merges the command record and ensures the log file exists.
    ///
    /// Safe to call repeatedly: the first call creates the record, later
    /// calls overlay `pid`/`trigger_run_id`. Metadata is only rewritten when
    /// the record is new or an optional field was supplied, a finalized
    /// record is never touched, and an existing log file is never truncated.
    pub async fn initialize(&self, sandbox_id: &str, cmd_id: &str, options: InitOptions) -> Result<()> {
        let paths = self.paths(cmd_id)?;
        let session = self.connector.connect(sandbox_id).await?;
        session.make_dir_all(&paths.dir).await?;

        let existing = read_record(&session, &paths.meta).await?;
        let is_new = existing.is_none();
        let is_terminal = existing.as_ref().is_some_and(CommandRecord::is_terminal);
        let mut record = existing
            .unwrap_or_else(|| CommandRecord::new(sandbox_id, cmd_id, now_millis()));

        if let Some(run_id) = &options.trigger_run_id {
            if record.trigger_run_id.as_ref() != Some(run_id) {
                record.trigger_run_id = Some(run_id.clone());
            }
        }
        if let Some(pid) = options.pid {
            if record.pid != Some(pid) {
                record.pid = Some(pid);
            }
        }

        let meta_bytes = serde_json::to_vec(&record)?;
        let logs_exist = session.read_file(&paths.logs).await?.is_some();

        let mut writes = Vec::new();
        if is_terminal {
            if !options.is_empty() {
                tracing::debug!(
                    sandbox_id = %sandbox_id,
                    cmd_id = %cmd_id,
                    "command already finalized, attach skipped"
                );
            }
        } else if is_new || !options.is_empty() {
            writes.push(session.write_file(&paths.meta, &meta_bytes));
        }
        if !logs_exist {
            writes.push(session.write_file(&paths.logs, b""));
        }
        let write_count = writes.len();
        try_join_all(writes).await?;

        tracing::debug!(
            sandbox_id = %sandbox_id,
            cmd_id = %cmd_id,
            pid = ?record.pid,
            trigger_run_id = ?record.trigger_run_id,
            writes = write_count,
            "command artifacts initialized"
        );
        Ok(())
    }

    /// Marks the command terminal and replaces its log with the captured output.
    ///
    /// Meant to be called exactly once per command. A second call keeps the
    /// same observable exit code but replaces the log content again.
    pub async fn finalize(
        &self,
        sandbox_id: &str,
        cmd_id: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        let paths = self.paths(cmd_id)?;
        let session = self.connector.connect(sandbox_id).await?;
        session.make_dir_all(&paths.dir).await?;

        let mut record = read_record(&session, &paths.meta)
            .await?
            .unwrap_or_else(|| CommandRecord::new(sandbox_id, cmd_id, now_millis()));
        record.exit_code = Some(exit_code);

        let meta_bytes = serde_json::to_vec(&record)?;
        let log = render_log(stdout, stderr, now_millis())?;

        try_join_all([
            session.write_file(&paths.meta, &meta_bytes),
            session.write_file(&paths.logs, log.as_bytes()),
        ])
        .await?;

        tracing::debug!(
            sandbox_id = %sandbox_id,
            cmd_id = %cmd_id,
            exit_code,
            "command artifacts finalized"
        );
        Ok(())
    }

    /// Reads the command record.
    ///
    /// Missing and unparseable metadata both come back as `None`; callers
    /// cannot tell corruption from absence. Storage failures still propagate.
    pub async fn read_meta(&self, sandbox_id: &str, cmd_id: &str) -> Result<Option<CommandRecord>> {
        let Ok(paths) = self.paths(cmd_id) else {
            return Ok(None);
        };
        let session = self.connector.connect(sandbox_id).await?;
        read_record(&session, &paths.meta).await
    }

    /// Reads the full current log content, or `None` before initialization.
    pub async fn read_logs(&self, sandbox_id: &str, cmd_id: &str) -> Result<Option<String>> {
        let Ok(paths) = self.paths(cmd_id) else {
            return Ok(None);
        };
        let session = self.connector.connect(sandbox_id).await?;
        Ok(session
            .read_file(&paths.logs)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }
}

async fn read_record<F: RemoteFs + ?Sized>(fs: &F, path: &str) -> Result<Option<CommandRecord>> {
    let Some(raw) = fs.read_file(path).await? else {
        return Ok(None);
    };
    match parse_record(&raw, path) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unparseable command metadata");
            Ok(None)
        }
    }
}

fn parse_record(raw: &[u8], path: &str) -> Result<CommandRecord> {
    serde_json::from_slice(raw).map_err(|e| Error::Parse(format!("{}: {}", path, e)))
}
