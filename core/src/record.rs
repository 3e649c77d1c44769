//! Persisted command metadata and log line types.

use serde::{Deserialize, Serialize};

/// Persisted metadata for one command invocation (`meta.json`).
///
/// The presence of `exit_code` marks the record as terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    /// Owning sandbox.
    pub sandbox_id: String,
    /// Command identifier (`cmd_<hex>`).
    pub cmd_id: String,
    /// Record creation time in epoch milliseconds.
    pub started_at: i64,
    /// Process id of a locally started background command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Exit code, set once at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Run id of the delegated worker executing this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_run_id: Option<String>,
}

impl CommandRecord {
    /// Creates a fresh, non-terminal record started at `started_at`.
    pub fn new(sandbox_id: impl Into<String>, cmd_id: impl Into<String>, started_at: i64) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            cmd_id: cmd_id.into(),
            started_at,
            pid: None,
            exit_code: None,
            trigger_run_id: None,
        }
    }

    /// Returns true once the command has been finalized.
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One record of `logs.ndjson`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub data: String,
    pub stream: LogStream,
    /// Epoch milliseconds at finalization.
    pub timestamp: i64,
}

/// Renders the finalized log file: one JSON line per non-empty stream,
/// each terminated by `\n`. Empty output yields an empty string.
pub fn render_log(stdout: &str, stderr: &str, timestamp: i64) -> serde_json::Result<String> {
    let mut out = String::new();
    for (stream, data) in [(LogStream::Stdout, stdout), (LogStream::Stderr, stderr)] {
        if data.is_empty() {
            continue;
        }
        let line = LogLine {
            data: data.to_string(),
            stream,
            timestamp,
        };
        out.push_str(&serde_json::to_string(&line)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parses ndjson log content, skipping blank lines.
pub fn parse_log(content: &str) -> serde_json::Result<Vec<LogLine>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
