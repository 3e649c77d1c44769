//! Command execution orchestration.
//!
//! [`CommandRunner::run`] drives one command through
//! connect → initialize → execute → finalize and reports each transition
//! on an [`EventSink`]. Failures never propagate: they are normalized into a
//! [`RichError`], emitted as an `error` status and returned as the message.

use std::sync::Arc;

use serde_json::json;

use crate::background::BackgroundTasks;
use crate::command::Invocation;
use crate::config::{BackgroundMode, Config};
use crate::error::{Error, Result};
use crate::events::{CommandStatus, EventSink, RunCommandEvent};
use crate::ids::new_command_id;
use crate::rich_error::RichError;
use crate::store::{CommandStore, InitOptions};
use crate::transport::{CommandOutput, SandboxConnector, SandboxSession};
use crate::worker::{TaskDispatcher, WorkerPayload};

/// A request to run one command in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub sandbox_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub sudo: bool,
    /// Block until the command finishes.
    pub wait: bool,
}

impl RunRequest {
    /// Creates a foreground request without sudo.
    pub fn new<I, S>(sandbox_id: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sandbox_id: sandbox_id.into(),
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            sudo: false,
            wait: true,
        }
    }

    /// Runs the command through `sudo`.
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Starts the command in the background instead of waiting.
    pub fn in_background(mut self) -> Self {
        self.wait = false;
        self
    }
}

/// Per-call context shared by the execution paths.
struct RunContext<'a> {
    sandbox_id: &'a str,
    cmd_id: &'a str,
    invocation: &'a Invocation,
    events: &'a EventSink,
}

impl RunContext<'_> {
    fn event(&self, status: CommandStatus) -> RunCommandEvent {
        RunCommandEvent {
            sandbox_id: self.sandbox_id.to_string(),
            command_id: Some(self.cmd_id.to_string()),
            command: self.invocation.command.clone(),
            args: self.invocation.args.clone(),
            status,
            exit_code: None,
            error: None,
        }
    }

    async fn emit(&self, status: CommandStatus) {
        self.events.emit(self.event(status)).await;
    }

    /// Emits an error status and returns the rich message.
    async fn fail(&self, action: &str, args: serde_json::Value, error: Error) -> String {
        tracing::warn!(
            sandbox_id = %self.sandbox_id,
            cmd_id = %self.cmd_id,
            action = %action,
            error = %error,
            "run command failed"
        );
        let rich = RichError::new(action, Some(&args), &error);
        let mut event = self.event(CommandStatus::Error);
        event.error = Some(rich.error);
        self.events.emit(event).await;
        rich.message
    }
}

/// Runs commands in sandboxes and tracks them through a [`CommandStore`].
pub struct CommandRunner<C: SandboxConnector> {
    store: CommandStore<C>,
    background_mode: BackgroundMode,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    reapers: BackgroundTasks,
}

impl<C: SandboxConnector + 'static> CommandRunner<C> {
    /// Creates a runner using local background execution.
    pub fn new(store: CommandStore<C>) -> Self {
        Self {
            store,
            background_mode: BackgroundMode::Local,
            dispatcher: None,
            reapers: BackgroundTasks::new(),
        }
    }

    /// Creates a runner from configuration.
    pub fn from_config(connector: Arc<C>, config: &Config) -> Self {
        Self::new(CommandStore::with_root(connector, config.root.clone()))
            .with_background_mode(config.background_mode)
    }

    /// Sets the background execution strategy.
    pub fn with_background_mode(mut self, mode: BackgroundMode) -> Self {
        self.background_mode = mode;
        self
    }

    /// Sets the dispatcher used in [`BackgroundMode::Delegated`].
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Waits until every background command started by this runner has
    /// been finalized, including workers queued on the dispatcher.
    ///
    /// A process must call this before exiting, or a finalize still in
    /// flight can leave a terminal record next to an empty log.
    pub async fn join_background(&self) {
        self.reapers.join_all().await;
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.join_background().await;
        }
    }

    /// Returns the underlying artifact store.
    pub fn store(&self) -> &CommandStore<C> {
        &self.store
    }

    /// Runs `request` and returns a human-readable result message.
    pub async fn run(&self, request: RunRequest, events: &EventSink) -> String {
        let invocation = Invocation::new(request.command, request.args).normalize();
        let sandbox_id = request.sandbox_id.as_str();
        let cmd_id = new_command_id();
        let ctx = RunContext {
            sandbox_id,
            cmd_id: &cmd_id,
            invocation: &invocation,
            events,
        };

        let mut executing = ctx.event(CommandStatus::Executing);
        executing.command_id = None;
        events.emit(executing).await;

        let session = match self.store.connector().connect(sandbox_id).await {
            Ok(session) => session,
            Err(e) => {
                let rich = RichError::new(
                    "connect to sandbox",
                    Some(&json!({ "sandboxId": sandbox_id })),
                    &e,
                );
                let mut event = ctx.event(CommandStatus::Error);
                event.command_id = None;
                event.error = Some(rich.error);
                events.emit(event).await;
                return rich.message;
            }
        };

        ctx.emit(CommandStatus::Executing).await;

        if !request.wait {
            let started = match self.background_mode {
                BackgroundMode::Local => self.start_local(&ctx, session, request.sudo).await,
                BackgroundMode::Delegated => self.start_delegated(&ctx, request.sudo).await,
            };
            return match started {
                Ok(handle) => {
                    ctx.emit(CommandStatus::Running).await;
                    format!(
                        "The command `{}` has been started in the background in sandbox `{}` with commandId `{}` ({}).",
                        invocation.display(),
                        sandbox_id,
                        cmd_id,
                        handle
                    )
                }
                Err(e) => {
                    ctx.fail(
                        "start background command",
                        json!({ "sandboxId": sandbox_id, "cmdId": cmd_id }),
                        e,
                    )
                    .await
                }
            };
        }

        ctx.emit(CommandStatus::Waiting).await;

        match self.run_foreground(&ctx, &session, request.sudo).await {
            Ok(output) => {
                let mut done = ctx.event(CommandStatus::Done);
                done.exit_code = Some(output.exit_code);
                events.emit(done).await;
                format!(
                    "The command `{}` has finished with exit code {}.\
                     Stdout of the command was: \n```\n{}\n```\n\
                     Stderr of the command was: \n```\n{}\n```",
                    invocation.display(),
                    output.exit_code,
                    output.stdout,
                    output.stderr
                )
            }
            Err(e) => {
                ctx.fail(
                    "wait for command to finish",
                    json!({ "sandboxId": sandbox_id, "commandId": cmd_id }),
                    e,
                )
                .await
            }
        }
    }

    async fn run_foreground(
        &self,
        ctx: &RunContext<'_>,
        session: &C::Session,
        sudo: bool,
    ) -> Result<CommandOutput> {
        let dispatch = ctx.invocation.dispatch(sudo);
        self.store
            .initialize(ctx.sandbox_id, ctx.cmd_id, InitOptions::default())
            .await?;
        let output = session.run(&dispatch.command, &dispatch.args).await?;
        self.store
            .finalize(
                ctx.sandbox_id,
                ctx.cmd_id,
                output.exit_code,
                &output.stdout,
                &output.stderr,
            )
            .await?;
        Ok(output)
    }

    /// Starts the process in the sandbox, attaches its pid and spawns a
    /// reaper that finalizes the record once the process exits.
    ///
    /// A started process is always handed to the reaper, even when the pid
    /// attach fails, so it is still waited on.
    async fn start_local(&self, ctx: &RunContext<'_>, session: C::Session, sudo: bool) -> Result<String> {
        let dispatch = ctx.invocation.dispatch(sudo);
        self.store
            .initialize(ctx.sandbox_id, ctx.cmd_id, InitOptions::default())
            .await?;
        let pid = session.start(&dispatch.command, &dispatch.args).await?;
        let attached = self
            .store
            .initialize(ctx.sandbox_id, ctx.cmd_id, InitOptions::default().with_pid(pid))
            .await;

        let store = self.store.clone();
        let cmd_id = ctx.cmd_id.to_string();
        self.reapers.spawn(async move {
            if let Err(e) = reap(&store, &session, &cmd_id, pid).await {
                tracing::error!(
                    sandbox_id = %session.sandbox_id(),
                    cmd_id = %cmd_id,
                    pid,
                    error = %e,
                    "failed to reap background command, record left non-terminal"
                );
            }
        });

        attached?;
        Ok(format!("pid `{}`", pid))
    }

    /// Hands the command to the task dispatcher and attaches its run id.
    async fn start_delegated(&self, ctx: &RunContext<'_>, sudo: bool) -> Result<String> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| Error::Config("delegated background mode requires a task dispatcher".to_string()))?;

        self.store
            .initialize(ctx.sandbox_id, ctx.cmd_id, InitOptions::default())
            .await?;
        let handle = dispatcher
            .dispatch(WorkerPayload {
                sandbox_id: ctx.sandbox_id.to_string(),
                cmd_id: ctx.cmd_id.to_string(),
                command: ctx.invocation.command.clone(),
                args: Some(ctx.invocation.args.clone()),
                sudo: Some(sudo),
            })
            .await?;
        self.store
            .initialize(
                ctx.sandbox_id,
                ctx.cmd_id,
                InitOptions::default().with_trigger_run_id(handle.id.clone()),
            )
            .await?;

        tracing::info!(
            sandbox_id = %ctx.sandbox_id,
            cmd_id = %ctx.cmd_id,
            trigger_run_id = %handle.id,
            "background command delegated"
        );
        Ok(format!("run `{}`", handle.id))
    }
}

async fn reap<C: SandboxConnector>(
    store: &CommandStore<C>,
    session: &C::Session,
    cmd_id: &str,
    pid: u32,
) -> Result<()> {
    let sandbox_id = session.sandbox_id();
    let output = session.wait(pid).await?;
    store
        .finalize(sandbox_id, cmd_id, output.exit_code, &output.stdout, &output.stderr)
        .await?;
    tracing::info!(
        sandbox_id = %sandbox_id,
        cmd_id = %cmd_id,
        pid,
        exit_code = output.exit_code,
        "background command reaped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DispatchKind, MemoryConnector};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    async fn run_collecting(
        runner: &CommandRunner<MemoryConnector>,
        request: RunRequest,
    ) -> (String, Vec<RunCommandEvent>) {
        let (tx, mut rx) = mpsc::channel(16);
        let message = runner.run(request, &EventSink::new(tx)).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (message, events)
    }

    fn statuses(events: &[RunCommandEvent]) -> Vec<CommandStatus> {
        events.iter().map(|e| e.status).collect()
    }

    fn runner() -> (Arc<MemoryConnector>, CommandRunner<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::with_sandboxes(["sb1"]));
        let runner = CommandRunner::new(CommandStore::new(Arc::clone(&connector)));
        (connector, runner)
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        payloads: Mutex<Vec<WorkerPayload>>,
        joins: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskDispatcher for RecordingDispatcher {
        async fn dispatch(&self, payload: WorkerPayload) -> Result<crate::worker::RunHandle> {
            self.payloads.lock().unwrap().push(payload);
            Ok(crate::worker::RunHandle {
                id: "run_42".to_string(),
            })
        }

        async fn join_background(&self) {
            self.joins.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn foreground_run_finalizes_and_reports_done() {
        let (connector, runner) = runner();
        connector.script(
            "echo hi",
            CommandOutput {
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );

        let (message, events) = run_collecting(&runner, RunRequest::new("sb1", "echo", ["hi"])).await;

        assert_eq!(
            statuses(&events),
            vec![
                CommandStatus::Executing,
                CommandStatus::Executing,
                CommandStatus::Waiting,
                CommandStatus::Done
            ]
        );
        assert!(events[0].command_id.is_none());
        let cmd_id = events[1].command_id.clone().unwrap();
        assert_eq!(events[3].exit_code, Some(0));
        assert!(message.contains("has finished with exit code 0"));
        assert!(message.contains("```\nhi\n\n```"));

        let record = runner.store().read_meta("sb1", &cmd_id).await.unwrap().unwrap();
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let (connector, runner) = runner();
        connector.script(
            "false",
            CommandOutput {
                exit_code: 1,
                ..Default::default()
            },
        );

        let (_, events) = run_collecting(&runner, RunRequest::new("sb1", "false", Vec::<String>::new())).await;

        let last = events.last().unwrap();
        assert_eq!(last.status, CommandStatus::Done);
        assert_eq!(last.exit_code, Some(1));
    }

    #[tokio::test]
    async fn connect_failure_reports_error_without_command_id() {
        let (_, runner) = runner();

        let (message, events) = run_collecting(&runner, RunRequest::new("nope", "ls", Vec::<String>::new())).await;

        assert_eq!(statuses(&events), vec![CommandStatus::Executing, CommandStatus::Error]);
        assert!(events[1].command_id.is_none());
        assert!(message.starts_with("Error during connect to sandbox: sandbox nope not found"));
        assert!(message.contains("\"sandboxId\": \"nope\""));
    }

    #[tokio::test]
    async fn run_failure_leaves_record_non_terminal() {
        let (connector, runner) = runner();
        connector.fail_run("transport closed");

        let (message, events) = run_collecting(&runner, RunRequest::new("sb1", "ls", Vec::<String>::new())).await;

        let last = events.last().unwrap();
        assert_eq!(last.status, CommandStatus::Error);
        assert_eq!(last.error.as_ref().unwrap().message, "transport closed");
        assert!(message.starts_with("Error during wait for command to finish: transport closed"));

        let cmd_id = last.command_id.clone().unwrap();
        let record = runner.store().read_meta("sb1", &cmd_id).await.unwrap().unwrap();
        assert!(!record.is_terminal());
    }

    #[tokio::test]
    async fn pnpm_is_normalized_before_transport() {
        let (connector, runner) = runner();

        run_collecting(&runner, RunRequest::new("sb1", "pnpm", ["install"])).await;
        run_collecting(&runner, RunRequest::new("sb1", "npm", ["install"])).await;

        let dispatched = connector.dispatched();
        assert_eq!(dispatched[0].command, "corepack");
        assert_eq!(dispatched[0].args, vec!["pnpm", "install"]);
        assert_eq!(dispatched[1].command, "npm");
        assert_eq!(dispatched[1].args, vec!["install"]);
    }

    #[tokio::test]
    async fn sudo_wraps_command_once() {
        let (connector, runner) = runner();

        let (_, events) =
            run_collecting(&runner, RunRequest::new("sb1", "rm", ["-rf", "x"]).with_sudo(true)).await;

        let dispatched = connector.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].command, "sudo");
        assert_eq!(dispatched[0].args, vec!["rm", "-rf", "x"]);
        assert_eq!(events[0].command, "rm");
    }

    #[tokio::test]
    async fn local_background_attaches_pid_and_reaps() {
        let (connector, runner) = runner();
        connector.script(
            "sleep 1",
            CommandOutput {
                stdout: "slept\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );

        let (message, events) =
            run_collecting(&runner, RunRequest::new("sb1", "sleep", ["1"]).in_background()).await;

        assert_eq!(
            statuses(&events),
            vec![CommandStatus::Executing, CommandStatus::Executing, CommandStatus::Running]
        );
        assert!(message.contains("has been started in the background"));
        assert_eq!(connector.dispatched()[0].kind, DispatchKind::Start);

        let cmd_id = events[2].command_id.clone().unwrap();
        runner.join_background().await;

        let record = runner.store().read_meta("sb1", &cmd_id).await.unwrap().unwrap();
        assert_eq!(record.pid, Some(1001));
        assert_eq!(record.exit_code, Some(0));
        let logs = runner.store().read_logs("sb1", &cmd_id).await.unwrap().unwrap();
        assert!(logs.contains("\"data\":\"slept\\n\""));
    }

    #[tokio::test]
    async fn failed_pid_attach_still_reaps_started_process() {
        let (connector, runner) = runner();
        // The bare initialize writes meta and log; everything after fails.
        connector.fail_storage_after_writes(2, "disk full");

        let (message, events) =
            run_collecting(&runner, RunRequest::new("sb1", "sleep", ["1"]).in_background()).await;

        assert_eq!(events.last().unwrap().status, CommandStatus::Error);
        assert!(message.starts_with("Error during start background command: disk full"));
        assert_eq!(connector.live_pids(), vec![1001]);

        runner.join_background().await;

        assert!(connector.live_pids().is_empty());
    }

    #[tokio::test]
    async fn start_failure_reports_error() {
        let (connector, runner) = runner();
        connector.fail_start("no such binary");

        let (message, events) =
            run_collecting(&runner, RunRequest::new("sb1", "srv", Vec::<String>::new()).in_background()).await;

        assert_eq!(events.last().unwrap().status, CommandStatus::Error);
        assert!(message.starts_with("Error during start background command: no such binary"));
    }

    #[tokio::test]
    async fn delegated_background_attaches_run_id() {
        let (_, runner) = runner();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let runner = runner
            .with_background_mode(BackgroundMode::Delegated)
            .with_dispatcher(dispatcher.clone());

        let (message, events) = run_collecting(
            &runner,
            RunRequest::new("sb1", "pnpm", ["dev"]).with_sudo(true).in_background(),
        )
        .await;

        assert_eq!(events.last().unwrap().status, CommandStatus::Running);
        assert!(message.contains("run `run_42`"));

        let payloads = dispatcher.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].command, "corepack");
        assert_eq!(payloads[0].args, Some(vec!["pnpm".to_string(), "dev".to_string()]));
        assert_eq!(payloads[0].sudo, Some(true));

        let cmd_id = events.last().unwrap().command_id.clone().unwrap();
        let record = runner.store().read_meta("sb1", &cmd_id).await.unwrap().unwrap();
        assert_eq!(record.trigger_run_id.as_deref(), Some("run_42"));
        assert!(!record.is_terminal());

        runner.join_background().await;
        assert_eq!(dispatcher.joins.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delegated_mode_without_dispatcher_is_error() {
        let (_, runner) = runner();
        let runner = runner.with_background_mode(BackgroundMode::Delegated);

        let (message, events) =
            run_collecting(&runner, RunRequest::new("sb1", "ls", Vec::<String>::new()).in_background()).await;

        assert_eq!(events.last().unwrap().status, CommandStatus::Error);
        assert!(message.contains("requires a task dispatcher"));
    }
}
