//! Sandbox Commands CLI
//!
//! Runs and inspects tracked commands in local directory sandboxes.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use sandbox_commands::{
    log_stream, sandbox_status, status_snapshot, CommandRunner, CommandStatus, CommandStore, Config, EventSink,
    LocalConnector, RunCommandEvent, RunRequest, SpawnDispatcher, Validate,
};

const USAGE: &str = "\
Usage: sandbox-commands <base-dir> <sandbox-id> <action>

Actions:
  create                                  Create the sandbox directory
  ping                                    Print whether the sandbox is running
  run [--bg] [--sudo] <command> [args..]  Run a command (foreground unless --bg)
  status <cmd-id>                         Print the command snapshot as JSON
  logs <cmd-id>                           Follow the command log until it finishes

Environment variables:
  SANDBOX_COMMANDS_CONFIG      Path to a TOML config file
  SANDBOX_COMMANDS_ROOT        Storage root inside the sandbox
  SANDBOX_COMMANDS_POLL_MS     Log poll interval in milliseconds
  SANDBOX_COMMANDS_BACKGROUND  Background mode: local or delegated";

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse args (basic, no subcommand framework)
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    if let Err(e) = dispatch(&args[1], &args[2], &args[3], &args[4..]).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(
    base_dir: &str,
    sandbox_id: &str,
    action: &str,
    rest: &[String],
) -> sandbox_commands::Result<()> {
    let config_path = std::env::var("SANDBOX_COMMANDS_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "config warning");
    }

    let connector = Arc::new(LocalConnector::new(base_dir));
    let store = CommandStore::with_root(Arc::clone(&connector), config.root.clone());

    match action {
        "create" => {
            let dir = connector.create_sandbox(sandbox_id).await?;
            println!("{}", dir.display());
        }
        "run" => {
            let mut background = false;
            let mut sudo = false;
            let mut rest = rest.iter().peekable();
            while let Some(flag) = rest.next_if(|a| a.starts_with("--")) {
                match flag.as_str() {
                    "--bg" => background = true,
                    "--sudo" => sudo = true,
                    other => {
                        return Err(sandbox_commands::Error::Config(format!("unknown flag {}", other)))
                    }
                }
            }
            let Some(command) = rest.next() else {
                return Err(sandbox_commands::Error::Config("missing command".to_string()));
            };

            let mut request = RunRequest::new(sandbox_id, command.clone(), rest.cloned()).with_sudo(sudo);
            if background {
                request = request.in_background();
            }

            let runner = CommandRunner::from_config(Arc::clone(&connector), &config)
                .with_dispatcher(SpawnDispatcher::new(store.clone()).into_shared());
            let (tx, mut rx) = mpsc::channel::<RunCommandEvent>(16);
            let printer = tokio::spawn(async move {
                let mut last = None;
                while let Some(event) = rx.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        eprintln!("{}", line);
                    }
                    last = Some(event);
                }
                last
            });

            let message = runner.run(request, &EventSink::new(tx)).await;
            let last = printer.await.ok().flatten();
            println!("{}", message);

            // Background work runs in this process; follow the log so it can finish.
            let Some(cmd_id) = last
                .filter(|e| e.status == CommandStatus::Running)
                .and_then(|e| e.command_id)
            else {
                return Ok(());
            };
            let Some(printed) = follow(store.clone(), &config, sandbox_id, &cmd_id).await? else {
                return Ok(());
            };

            // Meta and log land concurrently; print whatever the tail missed.
            runner.join_background().await;
            if let Some(logs) = store.read_logs(sandbox_id, &cmd_id).await? {
                if let Some(rest) = logs.as_bytes().get(printed..).filter(|rest| !rest.is_empty()) {
                    let mut stdout = std::io::stdout();
                    stdout.write_all(rest)?;
                    stdout.flush()?;
                }
            }
        }
        "ping" => {
            let status = sandbox_status(connector.as_ref(), sandbox_id).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        "status" => {
            let cmd_id = rest
                .first()
                .ok_or_else(|| sandbox_commands::Error::Config("missing cmd-id".to_string()))?;
            let snapshot = status_snapshot(&store, sandbox_id, cmd_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "logs" => {
            let cmd_id = rest
                .first()
                .ok_or_else(|| sandbox_commands::Error::Config("missing cmd-id".to_string()))?;
            follow(store, &config, sandbox_id, cmd_id).await?;
        }
        other => {
            return Err(sandbox_commands::Error::Config(format!(
                "unknown action '{}'\n\n{}",
                other, USAGE
            )));
        }
    }

    Ok(())
}

/// Streams a command's log to stdout until it is terminal or Ctrl-C.
///
/// Returns the number of bytes written, or `None` when cancelled.
async fn follow(
    store: CommandStore<LocalConnector>,
    config: &Config,
    sandbox_id: &str,
    cmd_id: &str,
) -> sandbox_commands::Result<Option<usize>> {
    let stream = log_stream(store, config, sandbox_id, cmd_id);
    tokio::pin!(stream);
    let mut printed = 0;

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    let mut stdout = std::io::stdout();
                    stdout.write_all(&chunk)?;
                    stdout.flush()?;
                    printed += chunk.len();
                }
                None => return Ok(Some(printed)),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(cmd_id = %cmd_id, "log follow cancelled");
                return Ok(None);
            }
        }
    }
}
