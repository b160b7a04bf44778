//! Operator console on stdin.
//!
//! Commands (arguments follow shell quoting rules):
//!   list | json
//!   test <script> <delay_secs> <id>[,<id>...] [params...]
//!   cancel <id> | reload <id> | restart <id> | disconnect <id>
//!   distance <id> <id>
//!   help | quit

use crate::roster::RosterEntry;
use crate::station::BaseStation;
use anyhow::{anyhow, bail, Context, Result};
use bue_ota::Shutdown;
use std::io::BufRead;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error};

const INPUT_QUEUE_CAPACITY: usize = 16;
const RECV_TIMEOUT: Duration = Duration::from_millis(200);

pub const HELP: &str = "\
commands:
  list                                    connected bUEs
  json                                    roster as JSON
  test <script> <delay> <id>[,<id>...] [params...]
  cancel <id>
  reload <id>
  restart <id>
  disconnect <id>
  distance <id> <id>
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Json,
    Test {
        script: String,
        delay_secs: u64,
        ids: Vec<u16>,
        params: Vec<String>,
    },
    Cancel(u16),
    Reload(u16),
    Restart(u16),
    Disconnect(u16),
    Distance(u16, u16),
    Help,
    Quit,
}

fn parse_id(arg: Option<&String>) -> Result<u16> {
    let arg = arg.ok_or_else(|| anyhow!("missing bUE id"))?;
    arg.parse::<u16>().with_context(|| format!("invalid bUE id {arg:?}"))
}

/// Parses one console line; blank lines give `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let args = shell_words::split(line).context("unbalanced quotes")?;
    let Some((name, rest)) = args.split_first() else {
        return Ok(None);
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "list" | "ls" => ConsoleCommand::List,
        "json" => ConsoleCommand::Json,
        "test" => {
            let [script, delay, ids, params @ ..] = rest else {
                bail!("usage: test <script> <delay> <id>[,<id>...] [params...]");
            };
            let delay_secs = delay
                .parse::<u64>()
                .with_context(|| format!("invalid delay {delay:?}"))?;
            let ids = ids
                .split(',')
                .map(|id| id.trim().parse::<u16>().with_context(|| format!("invalid bUE id {id:?}")))
                .collect::<Result<Vec<_>>>()?;
            ConsoleCommand::Test {
                script: script.clone(),
                delay_secs,
                ids,
                params: params.to_vec(),
            }
        }
        "cancel" => ConsoleCommand::Cancel(parse_id(rest.first())?),
        "reload" => ConsoleCommand::Reload(parse_id(rest.first())?),
        "restart" => ConsoleCommand::Restart(parse_id(rest.first())?),
        "disconnect" => ConsoleCommand::Disconnect(parse_id(rest.first())?),
        "distance" => ConsoleCommand::Distance(parse_id(rest.first())?, parse_id(rest.get(1))?),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?}, try 'help'"),
    };
    Ok(Some(command))
}

fn format_entry(entry: &RosterEntry) -> String {
    let seen = Duration::from_secs(entry.last_seen.elapsed().as_secs());
    let position = match entry.last_position {
        Some(p) => format!("{:.6},{:.6}", p.lat, p.lon),
        None => "-".to_string(),
    };
    format!(
        "{:>5}  {:<16} {:<11} missed={:<2} seen {} ago  pos={}{}",
        entry.id,
        entry.hostname,
        if entry.reported_state.is_empty() { "-" } else { entry.reported_state.as_str() },
        entry.missed_liveness_count,
        humantime::format_duration(seen),
        position,
        if entry.testing { "  [testing]" } else { "" },
    )
}

/// Runs `command` and renders the operator-facing result.
pub fn execute(station: &BaseStation, command: ConsoleCommand) -> Result<String> {
    let output = match command {
        ConsoleCommand::List => {
            let entries = station.snapshot();
            if entries.is_empty() {
                "no bUEs connected".to_string()
            } else {
                entries.iter().map(format_entry).collect::<Vec<_>>().join("\n")
            }
        }
        ConsoleCommand::Json => serde_json::to_string_pretty(&station.snapshot())?,
        ConsoleCommand::Test { script, delay_secs, ids, params } => {
            let start = station.send_test(&ids, &script, delay_secs, &params)?;
            format!("sent {script} to {ids:?}, starting at {start}")
        }
        ConsoleCommand::Cancel(id) => {
            station.cancel_test(id)?;
            format!("sent CANC to {id}")
        }
        ConsoleCommand::Reload(id) => {
            station.reload(id)?;
            format!("sent RELOAD to {id}, disconnected")
        }
        ConsoleCommand::Restart(id) => {
            station.restart(id)?;
            format!("sent RESTART to {id}, disconnected")
        }
        ConsoleCommand::Disconnect(id) => {
            let entry = station.disconnect(id)?;
            format!("disconnected {} ({})", id, entry.hostname)
        }
        ConsoleCommand::Distance(a, b) => {
            let metres = station.distance(a, b)?;
            format!("{a} <-> {b}: {metres:.1} m")
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => "shutting down".to_string(),
    };
    Ok(output)
}

/// Reads commands from stdin until `quit` or shutdown. The reader thread
/// blocks on stdin and is left detached when the console stops.
pub async fn run(station: BaseStation, shutdown: Shutdown) {
    let (lines_tx, mut lines) = mpsc::channel::<String>(INPUT_QUEUE_CAPACITY);
    let spawned = std::thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if lines_tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
        });
    let mut stdin_open = spawned.is_ok();
    if let Err(e) = spawned {
        error!("failed to start console reader: {}", e);
    }

    println!("{HELP}");
    while !shutdown.is_triggered() {
        if !stdin_open {
            tokio::time::sleep(RECV_TIMEOUT).await;
            continue;
        }
        let line = match timeout(RECV_TIMEOUT, lines.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, console disabled");
                stdin_open = false;
                continue;
            }
            Err(_) => continue,
        };

        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(command)) => {
                let quit = command == ConsoleCommand::Quit;
                match execute(&station, command) {
                    Ok(output) => println!("{output}"),
                    Err(e) => println!("error: {e:#}"),
                }
                if quit {
                    shutdown.trigger();
                }
            }
            Err(e) => println!("error: {e:#}"),
        }
    }
}
