//! Caller-facing status events emitted while a command runs.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::rich_error::ErrorFields;

/// Status of a run-command call as seen by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Connecting / preparing.
    Executing,
    /// Foreground run in progress; the caller is blocked.
    Waiting,
    /// Background run started; poll by command id.
    Running,
    /// Foreground run finished.
    Done,
    /// Any step failed.
    Error,
}

/// One status transition of a run-command call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommandEvent {
    pub sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorFields>,
}

/// Sending side of a status event channel.
///
/// A dropped receiver is not an error: the run continues unobserved.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RunCommandEvent>,
}

impl EventSink {
    /// Wraps a channel sender.
    pub fn new(tx: mpsc::Sender<RunCommandEvent>) -> Self {
        Self { tx }
    }

    /// Sends `event`, ignoring a closed channel.
    pub async fn emit(&self, event: RunCommandEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("status receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_like_data_part() {
        let event = RunCommandEvent {
            sandbox_id: "sb1".to_string(),
            command_id: Some("cmd_1".to_string()),
            command: "ls".to_string(),
            args: vec!["-la".to_string()],
            status: CommandStatus::Done,
            exit_code: Some(0),
            error: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sandboxId"], "sb1");
        assert_eq!(json["commandId"], "cmd_1");
        assert_eq!(json["status"], "done");
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(tx);

        sink.emit(RunCommandEvent {
            sandbox_id: "sb1".to_string(),
            command_id: None,
            command: "ls".to_string(),
            args: vec![],
            status: CommandStatus::Executing,
            exit_code: None,
            error: None,
        })
        .await;
    }
}
