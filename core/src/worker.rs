//! Delegated command worker.
//!
//! A worker receives a [`WorkerPayload`] from a task dispatcher and drives
//! the command to completion through the same artifact contract as a
//! foreground run: initialize (attaching its run id), connect, run,
//! finalize.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::background::BackgroundTasks;
use crate::command::Invocation;
use crate::error::{Error, ProviderError, Result};
use crate::ids::is_command_id;
use crate::store::{CommandStore, InitOptions};
use crate::transport::{SandboxConnector, SandboxSession};

/// Input handed to a delegated worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub sandbox_id: String,
    pub cmd_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<bool>,
}

impl WorkerPayload {
    /// Returns what the transport should execute, sudo applied.
    pub fn dispatch(&self) -> Invocation {
        Invocation::new(self.command.clone(), self.args.clone().unwrap_or_default())
            .dispatch(self.sudo.unwrap_or(false))
    }
}

/// Result returned by a delegated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub exit_code: i32,
}

/// Handle to a dispatched worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub id: String,
}

/// External task dispatcher that runs workers on the caller's behalf.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Queues a worker run for `payload`.
    async fn dispatch(&self, payload: WorkerPayload) -> Result<RunHandle>;

    /// Waits for runs this dispatcher executes in the current process.
    ///
    /// Remote dispatchers have nothing to wait for.
    async fn join_background(&self) {}
}

/// Runs one delegated command to completion.
pub async fn run_worker<C: SandboxConnector>(
    store: &CommandStore<C>,
    payload: &WorkerPayload,
    run_id: &str,
) -> Result<WorkerOutput> {
    tracing::info!(
        trigger_run_id = %run_id,
        sandbox_id = %payload.sandbox_id,
        cmd_id = %payload.cmd_id,
        command = %payload.command,
        sudo = payload.sudo.unwrap_or(false),
        "worker started"
    );
    let invocation = payload.dispatch();

    store
        .initialize(
            &payload.sandbox_id,
            &payload.cmd_id,
            InitOptions::default().with_trigger_run_id(run_id),
        )
        .await?;

    let session = store.connector().connect(&payload.sandbox_id).await?;
    let output = session.run(&invocation.command, &invocation.args).await?;
    tracing::info!(
        trigger_run_id = %run_id,
        cmd_id = %payload.cmd_id,
        exit_code = output.exit_code,
        "worker command completed"
    );

    store
        .finalize(
            &payload.sandbox_id,
            &payload.cmd_id,
            output.exit_code,
            &output.stdout,
            &output.stderr,
        )
        .await?;
    tracing::info!(trigger_run_id = %run_id, cmd_id = %payload.cmd_id, "worker artifacts finalized");

    Ok(WorkerOutput {
        exit_code: output.exit_code,
    })
}

/// In-process dispatcher that runs each worker on a tokio task.
///
/// Workers start after `start_delay`, which stands in for queue latency so
/// the dispatching side's run-id attach lands before the worker finalizes.
pub struct SpawnDispatcher<C: SandboxConnector> {
    store: CommandStore<C>,
    start_delay: Duration,
    workers: BackgroundTasks,
}

impl<C: SandboxConnector> SpawnDispatcher<C> {
    /// Creates a dispatcher with the default 250ms start delay.
    pub fn new(store: CommandStore<C>) -> Self {
        Self {
            store,
            start_delay: Duration::from_millis(250),
            workers: BackgroundTasks::new(),
        }
    }

    /// Sets the delay before a dispatched worker starts.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Wraps the dispatcher for use by the orchestrator.
    pub fn into_shared(self) -> Arc<dyn TaskDispatcher>
    where
        C: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<C: SandboxConnector + 'static> TaskDispatcher for SpawnDispatcher<C> {
    async fn dispatch(&self, payload: WorkerPayload) -> Result<RunHandle> {
        if payload.sandbox_id.is_empty() || payload.command.trim().is_empty() {
            return Err(Error::Dispatch(
                ProviderError::new("payload needs a sandbox id and a command")
                    .with_json(serde_json::to_value(&payload)?),
            ));
        }
        if !is_command_id(&payload.cmd_id) {
            return Err(Error::Dispatch(ProviderError::new(format!(
                "invalid command id: {:?}",
                payload.cmd_id
            ))));
        }

        let id = format!("run_{}", uuid::Uuid::new_v4().simple());
        let store = self.store.clone();
        let delay = self.start_delay;
        let run_id = id.clone();

        self.workers.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = run_worker(&store, &payload, &run_id).await {
                tracing::error!(
                    trigger_run_id = %run_id,
                    cmd_id = %payload.cmd_id,
                    error = %e,
                    "worker failed, command left non-terminal"
                );
            }
        });

        tracing::debug!(trigger_run_id = %id, "worker dispatched");
        Ok(RunHandle { id })
    }

    async fn join_background(&self) {
        self.workers.join_all().await;
    }
}
