//! Framework-free handlers behind the HTTP read endpoints.
//!
//! Routing lives elsewhere; these functions produce the response bodies.

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::now_millis;
use crate::store::CommandStore;
use crate::tail::LogTail;
use crate::transport::{RemoteFs, SandboxConnector, SandboxSession};

/// Content type of the log stream body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Body of the status snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSnapshot {
    pub sandbox_id: String,
    pub cmd_id: String,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Liveness of a sandbox as reported by the sandbox status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
}

/// Checks whether a sandbox is alive by running a trivial command in it.
///
/// A sandbox that cannot be connected to is `Stopped`. Failures of the
/// check command itself propagate.
pub async fn sandbox_status<C: SandboxConnector>(connector: &C, sandbox_id: &str) -> Result<SandboxStatus> {
    let session = match connector.connect(sandbox_id).await {
        Ok(session) => session,
        Err(Error::Connection(e)) => {
            tracing::debug!(sandbox_id = %sandbox_id, error = %e, "sandbox unreachable");
            return Ok(SandboxStatus::Stopped);
        }
        Err(e) => return Err(e),
    };
    session
        .run("echo", &["sandbox status check".to_string()])
        .await?;
    Ok(SandboxStatus::Running)
}

/// Returns the current snapshot of a command.
///
/// A command with no record yet reports `started_at` as now.
pub async fn status_snapshot<C: SandboxConnector>(
    store: &CommandStore<C>,
    sandbox_id: &str,
    cmd_id: &str,
) -> Result<CommandSnapshot> {
    let record = store.read_meta(sandbox_id, cmd_id).await?;
    Ok(CommandSnapshot {
        sandbox_id: sandbox_id.to_string(),
        cmd_id: cmd_id.to_string(),
        started_at: record.as_ref().map(|r| r.started_at).unwrap_or_else(now_millis),
        exit_code: record.and_then(|r| r.exit_code),
    })
}

/// Returns the long-lived log body: raw ndjson bytes flushed as they
/// appear, ending once the command is terminal.
pub fn log_stream<C: SandboxConnector>(
    store: CommandStore<C>,
    config: &Config,
    sandbox_id: &str,
    cmd_id: &str,
) -> impl Stream<Item = Result<Vec<u8>>> {
    LogTail::new(store, sandbox_id, cmd_id)
        .with_interval(config.poll_interval())
        .into_stream()
}

/// Fetches a raw file from a sandbox, `None` when it does not exist.
pub async fn fetch_file<C: SandboxConnector>(
    connector: &C,
    sandbox_id: &str,
    path: &str,
) -> Result<Option<Vec<u8>>> {
    let session = connector.connect(sandbox_id).await?;
    session.read_file(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InitOptions;
    use crate::testing::MemoryConnector;
    use futures::StreamExt;
    use std::sync::Arc;

    fn store() -> (Arc<MemoryConnector>, CommandStore<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::with_sandboxes(["sb1"]));
        (Arc::clone(&connector), CommandStore::new(connector))
    }

    #[tokio::test]
    async fn snapshot_of_unknown_command_defaults_started_at() {
        let (_, store) = store();
        let before = now_millis();

        let snapshot = status_snapshot(&store, "sb1", "cmd_abc").await.unwrap();

        assert!(snapshot.started_at >= before);
        assert_eq!(snapshot.exit_code, None);
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap().as_object().unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn snapshot_reports_exit_code_when_finalized() {
        let (_, store) = store();
        store.initialize("sb1", "cmd_abc", InitOptions::default()).await.unwrap();
        let started_at = store.read_meta("sb1", "cmd_abc").await.unwrap().unwrap().started_at;
        store.finalize("sb1", "cmd_abc", 7, "", "").await.unwrap();

        let snapshot = status_snapshot(&store, "sb1", "cmd_abc").await.unwrap();

        assert_eq!(snapshot.started_at, started_at);
        assert_eq!(snapshot.exit_code, Some(7));
        assert_eq!(serde_json::to_value(&snapshot).unwrap()["exitCode"], 7);
    }

    #[tokio::test]
    async fn log_stream_returns_finalized_content() {
        let (_, store) = store();
        store.finalize("sb1", "cmd_abc", 0, "x", "").await.unwrap();
        let expected = store.read_logs("sb1", "cmd_abc").await.unwrap().unwrap();

        let config = Config {
            poll_interval_ms: 1,
            ..Default::default()
        };
        let body: Vec<u8> = log_stream(store, &config, "sb1", "cmd_abc")
            .map(|chunk| chunk.unwrap())
            .concat()
            .await;

        assert_eq!(body, expected.into_bytes());
    }

    #[tokio::test]
    async fn live_sandbox_reports_running() {
        let (connector, _) = store();

        let status = sandbox_status(connector.as_ref(), "sb1").await.unwrap();

        assert_eq!(status, SandboxStatus::Running);
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"status":"running"}"#);
        let dispatched = connector.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].command, "echo");
    }

    #[tokio::test]
    async fn unknown_sandbox_reports_stopped() {
        let (connector, _) = store();

        let status = sandbox_status(connector.as_ref(), "gone").await.unwrap();

        assert_eq!(status, SandboxStatus::Stopped);
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"status":"stopped"}"#);
    }

    #[tokio::test]
    async fn failing_status_check_propagates() {
        let (connector, _) = store();
        connector.fail_run("exec refused");

        let err = sandbox_status(connector.as_ref(), "sb1").await.unwrap_err();

        assert!(matches!(err, Error::Execution(_)));
    }

    #[tokio::test]
    async fn fetch_file_distinguishes_missing() {
        let (connector, _) = store();
        connector.put_file("sb1", "/app/package.json", b"{}");

        assert_eq!(
            fetch_file(connector.as_ref(), "sb1", "/app/package.json").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(fetch_file(connector.as_ref(), "sb1", "/nope").await.unwrap(), None);
    }
}
