//! Sandbox Commands - durable command lifecycle tracking for remote sandboxes
//!
//! This library starts commands inside externally managed sandboxes, persists
//! their metadata and output in the sandbox's own filesystem, and lets other
//! processes poll that state while the command runs.

pub mod background;
pub mod command;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod ids;
pub mod local;
pub mod orchestrator;
pub mod record;
pub mod rich_error;
pub mod store;
pub mod tail;
pub mod testing;
pub mod transport;
pub mod worker;

pub use background::BackgroundTasks;
pub use command::{Invocation, Rewrite, REWRITES};
pub use config::{BackgroundMode, Config, Validate, ValidationResult};
pub use endpoints::{
    fetch_file, log_stream, sandbox_status, status_snapshot, CommandSnapshot, SandboxStatus,
    NDJSON_CONTENT_TYPE,
};
pub use error::{Error, ProviderError, Result};
pub use events::{CommandStatus, EventSink, RunCommandEvent};
pub use ids::new_command_id;
pub use local::{LocalConnector, LocalSession};
pub use orchestrator::{CommandRunner, RunRequest};
pub use record::{CommandRecord, LogLine, LogStream};
pub use rich_error::{ErrorFields, RichError};
pub use store::{CommandPaths, CommandStore, InitOptions, DEFAULT_ROOT};
pub use tail::{LogTail, TailPoll};
pub use transport::{CommandOutput, RemoteFs, SandboxConnector, SandboxSession};
pub use worker::{run_worker, RunHandle, SpawnDispatcher, TaskDispatcher, WorkerOutput, WorkerPayload};
