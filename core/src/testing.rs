//! In-memory sandbox transport for tests.
//!
//! [`MemoryConnector`] keeps every sandbox's files in a map, answers
//! `run`/`wait` from scripted outputs and records each dispatched
//! invocation so tests can assert on what reached the transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, ProviderError, Result};
use crate::transport::{CommandOutput, RemoteFs, SandboxConnector, SandboxSession};

/// How an invocation reached the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Run,
    Start,
}

/// A command line that reached the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub sandbox_id: String,
    pub kind: DispatchKind,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sandboxes: HashSet<String>,
    files: HashMap<(String, String), Vec<u8>>,
    dirs: HashSet<(String, String)>,
    outputs: HashMap<String, CommandOutput>,
    started: HashMap<u32, String>,
    next_pid: u32,
    dispatched: Vec<Dispatched>,
    writes: usize,
    storage_failure: Option<String>,
    storage_failure_after: Option<(usize, String)>,
    run_failure: Option<String>,
    start_failure: Option<String>,
}

/// In-memory [`SandboxConnector`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    /// Creates a connector that knows the given sandbox ids.
    pub fn with_sandboxes<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let connector = Self::default();
        connector.lock().sandboxes.extend(ids.into_iter().map(Into::into));
        connector
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scripts the output for a command line (`command args...` joined by spaces).
    pub fn script(&self, command_line: impl Into<String>, output: CommandOutput) {
        self.lock().outputs.insert(command_line.into(), output);
    }

    /// Writes a file directly, bypassing the write counter.
    pub fn put_file(&self, sandbox_id: &str, path: &str, data: &[u8]) {
        self.lock()
            .files
            .insert((sandbox_id.to_string(), path.to_string()), data.to_vec());
    }

    /// Returns true if `path` was created as a directory.
    pub fn has_dir(&self, sandbox_id: &str, path: &str) -> bool {
        self.lock()
            .dirs
            .contains(&(sandbox_id.to_string(), path.to_string()))
    }

    /// Number of `write_file` calls served so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Every invocation that reached the transport, in order.
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.lock().dispatched.clone()
    }

    /// Makes every storage call fail with `message`.
    pub fn fail_storage(&self, message: impl Into<String>) {
        self.lock().storage_failure = Some(message.into());
    }

    /// Makes every storage call fail with `message` once `writes` writes
    /// have been served.
    pub fn fail_storage_after_writes(&self, writes: usize, message: impl Into<String>) {
        self.lock().storage_failure_after = Some((writes, message.into()));
    }

    /// Pids started but not yet waited on, in ascending order.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().started.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Makes `run` and `wait` fail with `message`.
    pub fn fail_run(&self, message: impl Into<String>) {
        self.lock().run_failure = Some(message.into());
    }

    /// Makes `start` fail with `message`.
    pub fn fail_start(&self, message: impl Into<String>) {
        self.lock().start_failure = Some(message.into());
    }
}

#[async_trait]
impl SandboxConnector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, sandbox_id: &str) -> Result<MemorySession> {
        if !self.lock().sandboxes.contains(sandbox_id) {
            return Err(Error::Connection(ProviderError::new(format!(
                "sandbox {} not found",
                sandbox_id
            ))));
        }
        Ok(MemorySession {
            sandbox_id: sandbox_id.to_string(),
            connector: self.clone(),
        })
    }
}

/// Session handed out by [`MemoryConnector`].
#[derive(Debug, Clone)]
pub struct MemorySession {
    sandbox_id: String,
    connector: MemoryConnector,
}

impl MemorySession {
    fn key(&self, path: &str) -> (String, String) {
        (self.sandbox_id.clone(), path.to_string())
    }

    fn check_storage(state: &MemoryState) -> Result<()> {
        if let Some(message) = &state.storage_failure {
            return Err(Error::Storage(ProviderError::new(message.clone())));
        }
        match &state.storage_failure_after {
            Some((after, message)) if state.writes >= *after => {
                Err(Error::Storage(ProviderError::new(message.clone())))
            }
            _ => Ok(()),
        }
    }

    fn record(&self, state: &mut MemoryState, kind: DispatchKind, command: &str, args: &[String]) -> String {
        state.dispatched.push(Dispatched {
            sandbox_id: self.sandbox_id.clone(),
            kind,
            command: command.to_string(),
            args: args.to_vec(),
        });
        std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl RemoteFs for MemorySession {
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.connector.lock();
        Self::check_storage(&state)?;
        state.writes += 1;
        state.files.insert(self.key(path), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.connector.lock();
        Self::check_storage(&state)?;
        Ok(state.files.get(&self.key(path)).cloned())
    }

    async fn make_dir_all(&self, path: &str) -> Result<()> {
        let mut state = self.connector.lock();
        Self::check_storage(&state)?;
        state.dirs.insert(self.key(path));
        Ok(())
    }
}

#[async_trait]
impl SandboxSession for MemorySession {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn run(&self, command: &str, args: &[String]) -> Result<CommandOutput> {
        let mut state = self.connector.lock();
        let line = self.record(&mut state, DispatchKind::Run, command, args);
        if let Some(message) = &state.run_failure {
            return Err(Error::Execution(ProviderError::new(message.clone())));
        }
        Ok(state.outputs.get(&line).cloned().unwrap_or_default())
    }

    async fn start(&self, command: &str, args: &[String]) -> Result<u32> {
        let mut state = self.connector.lock();
        let line = self.record(&mut state, DispatchKind::Start, command, args);
        if let Some(message) = &state.start_failure {
            return Err(Error::Execution(ProviderError::new(message.clone())));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.started.insert(pid, line);
        Ok(pid)
    }

    async fn wait(&self, pid: u32) -> Result<CommandOutput> {
        let mut state = self.connector.lock();
        if let Some(message) = &state.run_failure {
            return Err(Error::Execution(ProviderError::new(message.clone())));
        }
        let line = state.started.remove(&pid).ok_or_else(|| {
            Error::Execution(ProviderError::new(format!("no process with pid {}", pid)))
        })?;
        Ok(state.outputs.get(&line).cloned().unwrap_or_default())
    }
}
