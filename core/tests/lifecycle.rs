//! End-to-end command lifecycle against the in-memory sandbox transport.

use std::sync::Arc;

use tokio_test::assert_ok;

use sandbox_commands::record::parse_log;
use sandbox_commands::testing::MemoryConnector;
use sandbox_commands::{
    status_snapshot, CommandRunner, CommandStatus, CommandStore, EventSink, InitOptions, LogStream,
    LogTail, RunRequest,
};

fn store() -> (Arc<MemoryConnector>, CommandStore<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::with_sandboxes(["sb1"]));
    let store = CommandStore::new(Arc::clone(&connector));
    (connector, store)
}

#[tokio::test]
async fn initialize_read_finalize_read() {
    let (_, store) = store();

    assert_eq!(assert_ok!(store.read_logs("sb1", "cmd_abc").await), None);

    assert_ok!(store.initialize("sb1", "cmd_abc", InitOptions::default()).await);
    assert_eq!(
        assert_ok!(store.read_logs("sb1", "cmd_abc").await).as_deref(),
        Some("")
    );

    assert_ok!(store.finalize("sb1", "cmd_abc", 0, "hello\n", "").await);

    let record = assert_ok!(store.read_meta("sb1", "cmd_abc").await).expect("record exists");
    assert_eq!(record.sandbox_id, "sb1");
    assert_eq!(record.cmd_id, "cmd_abc");
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.pid, None);
    assert_eq!(record.trigger_run_id, None);

    let logs = assert_ok!(store.read_logs("sb1", "cmd_abc").await).expect("log exists");
    let lines = parse_log(&logs).expect("valid ndjson");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].data, "hello\n");
    assert_eq!(lines[0].stream, LogStream::Stdout);
    assert_eq!(
        logs,
        format!(
            "{{\"data\":\"hello\\n\",\"stream\":\"stdout\",\"timestamp\":{}}}\n",
            lines[0].timestamp
        )
    );
}

#[tokio::test]
async fn interactive_and_worker_attaches_converge() {
    let (_, store) = store();

    assert_ok!(
        store
            .initialize("sb1", "cmd_f00d", InitOptions::default().with_trigger_run_id("run_1"))
            .await
    );
    assert_ok!(
        store
            .initialize("sb1", "cmd_f00d", InitOptions::default().with_pid(99))
            .await
    );

    let record = assert_ok!(store.read_meta("sb1", "cmd_f00d").await).expect("record exists");
    assert_eq!(record.pid, Some(99));
    assert_eq!(record.trigger_run_id.as_deref(), Some("run_1"));
}

#[tokio::test]
async fn tail_sees_foreground_run_output() {
    let (connector, store) = store();
    connector.script(
        "cat notes.txt",
        sandbox_commands::CommandOutput {
            stdout: "line one\n".to_string(),
            stderr: "warning\n".to_string(),
            exit_code: 0,
        },
    );
    let runner = CommandRunner::new(store.clone());

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    runner
        .run(RunRequest::new("sb1", "cat", ["notes.txt"]), &EventSink::new(tx))
        .await;

    let mut cmd_id = None;
    while let Some(event) = rx.recv().await {
        if event.status == CommandStatus::Done {
            cmd_id = event.command_id;
        }
    }
    let cmd_id = cmd_id.expect("run finished");

    let mut tail = LogTail::new(store.clone(), "sb1", cmd_id.clone());
    let poll = assert_ok!(tail.poll_once().await);
    assert!(poll.finished);
    let lines = parse_log(&String::from_utf8(poll.chunk.expect("output")).expect("utf8"))
        .expect("valid ndjson");
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1].data, "warning\n");

    let snapshot = assert_ok!(status_snapshot(&store, "sb1", &cmd_id).await);
    assert_eq!(snapshot.exit_code, Some(0));
}
