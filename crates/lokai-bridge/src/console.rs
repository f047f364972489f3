//! Line-oriented console for driving the bridge from a terminal.
//!
//! Reads commands from stdin, prints replies to stdout and approval prompts
//! plus worker diagnostics to stderr.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::AgentBridge;
use crate::approval::{ApprovalEvent, ApprovalOutcome, ApprovalResponse, RiskLevel};
use crate::rpc::StreamEvent;
use crate::subprocess::WorkerEvent;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Message(String),
    Status,
    Context,
    Tool { name: String, params: Value },
    Cancel,
    Approvals,
    Approve { id: String, remember: bool },
    Deny { id: String },
    Help,
    Quit,
    Empty,
}

/// Errors from parsing a console line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("/{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("Invalid JSON params: {0}")]
    InvalidJson(String),
}

pub const HELP: &str = "\
Commands:
  <text>                   send a message
  /status                  worker and approval status
  /context                 worker environment snapshot
  /tool <name> [json]      execute a tool
  /cancel                  cancel the current operation
  /approvals               list pending approvals
  /approve <id> [remember] approve a pending request
  /deny <id>               deny a pending request
  /quit                    stop the worker and exit";

/// Parse one input line.
pub fn parse_line(line: &str) -> Result<ConsoleCommand, CommandError> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        if line.is_empty() {
            return Ok(ConsoleCommand::Empty);
        }
        return Ok(ConsoleCommand::Message(line.to_string()));
    };

    let (command, args) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(c, a)| (c, a.trim()));

    match command {
        "status" => Ok(ConsoleCommand::Status),
        "context" => Ok(ConsoleCommand::Context),
        "cancel" => Ok(ConsoleCommand::Cancel),
        "approvals" => Ok(ConsoleCommand::Approvals),
        "help" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "tool" => {
            let (name, params) = args
                .split_once(char::is_whitespace)
                .map_or((args, ""), |(n, p)| (n, p.trim()));
            if name.is_empty() {
                return Err(CommandError::MissingArgument {
                    command: "tool",
                    argument: "a tool name",
                });
            }
            let params = if params.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(params).map_err(|e| CommandError::InvalidJson(e.to_string()))?
            };
            Ok(ConsoleCommand::Tool {
                name: name.to_string(),
                params,
            })
        }
        "approve" => {
            let mut parts = args.split_whitespace();
            let id = parts.next().ok_or(CommandError::MissingArgument {
                command: "approve",
                argument: "an approval id",
            })?;
            Ok(ConsoleCommand::Approve {
                id: id.to_string(),
                remember: parts.next() == Some("remember"),
            })
        }
        "deny" => {
            let id = args.split_whitespace().next().ok_or(CommandError::MissingArgument {
                command: "deny",
                argument: "an approval id",
            })?;
            Ok(ConsoleCommand::Deny { id: id.to_string() })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Read commands from `input` until EOF or `/quit`.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub async fn run<R>(bridge: Arc<AgentBridge>, input: R, stream: bool) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        match command {
            ConsoleCommand::Quit => break,
            // Replies run in the background so /cancel and /approve stay usable.
            ConsoleCommand::Message(_) => {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move {
                    if let Err(e) = execute(&bridge, command, stream).await {
                        eprintln!("[Error: {e}]");
                    }
                });
            }
            command => execute(&bridge, command, stream).await?,
        }
    }
    debug!("Console input finished");
    Ok(())
}

#[allow(clippy::print_stdout, clippy::print_stderr)]
async fn execute(bridge: &AgentBridge, command: ConsoleCommand, stream: bool) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Message(text) if stream => match bridge.send_message_streaming(&text).await {
            Ok(call) => {
                let mut events = std::pin::pin!(call.into_stream());
                while let Some(event) = events.next().await {
                    match event {
                        StreamEvent::Token(token) => {
                            print!("{token}");
                            std::io::stdout().flush()?;
                        }
                        StreamEvent::Complete(_) => println!(),
                        StreamEvent::Error(e) => eprintln!("\n[Error: {e}]"),
                    }
                }
            }
            Err(e) => eprintln!("[Error: {e}]"),
        },
        ConsoleCommand::Message(text) => match bridge.send_message(&text).await {
            Ok(reply) => println!("{}", reply_text(&reply)),
            Err(e) => eprintln!("[Error: {e}]"),
        },
        ConsoleCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&bridge.get_status())?);
        }
        ConsoleCommand::Context => match bridge.get_context().await {
            Ok(context) => println!("{}", serde_json::to_string_pretty(&context)?),
            Err(e) => eprintln!("[Error: {e}]"),
        },
        ConsoleCommand::Tool { name, params } => match bridge.execute_tool(&name, params).await {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => eprintln!("[Tool Error: {e}]"),
        },
        ConsoleCommand::Cancel => match bridge.cancel().await {
            Ok(outcome) if outcome.success => eprintln!("[Cancelled]"),
            Ok(outcome) => eprintln!("[{}]", outcome.message.unwrap_or_default()),
            Err(e) => eprintln!("[Error: {e}]"),
        },
        ConsoleCommand::Approvals => {
            let pending = bridge.list_approvals();
            if pending.is_empty() {
                println!("No pending approvals");
            }
            for p in pending {
                println!(
                    "{} [{}] {}: {}",
                    p.request.id,
                    risk_label(p.request.risk_level),
                    p.request.action,
                    p.request.description
                );
            }
        }
        ConsoleCommand::Approve { id, remember } => {
            let response = if remember {
                ApprovalResponse::approve().remembered()
            } else {
                ApprovalResponse::approve()
            };
            if let Err(e) = bridge.respond_to_approval(&id, response) {
                eprintln!("[{e}]");
            }
        }
        ConsoleCommand::Deny { id } => {
            if let Err(e) = bridge.respond_to_approval(&id, ApprovalResponse::deny()) {
                eprintln!("[{e}]");
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit | ConsoleCommand::Empty => {}
    }
    Ok(())
}

/// Print approval prompts and their resolution to stderr.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub async fn print_approval_events(mut events: broadcast::Receiver<ApprovalEvent>) {
    loop {
        match events.recv().await {
            Ok(ApprovalEvent::Requested(p)) => {
                eprintln!(
                    "[Approval {} ({} risk)] {}: {}",
                    p.request.id,
                    risk_label(p.request.risk_level),
                    p.request.action,
                    p.request.description
                );
                if let Some(preview) = &p.request.preview {
                    eprintln!("{preview}");
                }
                eprintln!("[/approve {0} [remember] or /deny {0}]", p.request.id);
            }
            Ok(ApprovalEvent::Resolved { id, outcome }) => {
                if matches!(outcome, ApprovalOutcome::TimedOut | ApprovalOutcome::Cancelled) {
                    eprintln!("[Approval {id} {}]", outcome_label(outcome));
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Approval events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Print worker lifecycle changes and malformed output to stderr.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub async fn print_worker_events(mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::StateChanged(state)) => eprintln!("[Worker {state}]"),
            Ok(WorkerEvent::MalformedRecord { reason, .. }) => {
                eprintln!("[Skipped malformed worker output: {reason}]");
            }
            Ok(WorkerEvent::Exited { code: Some(code) }) => eprintln!("[Worker exited with {code}]"),
            // Stderr lines are already logged by the supervisor.
            Ok(WorkerEvent::Stderr(_) | WorkerEvent::Exited { code: None }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Worker events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Text of a `process_message` reply; falls back to the raw JSON.
fn reply_text(reply: &Value) -> String {
    reply
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| reply.as_str())
        .map_or_else(|| reply.to_string(), ToString::to_string)
}

const fn risk_label(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
    }
}

const fn outcome_label(outcome: ApprovalOutcome) -> &'static str {
    match outcome {
        ApprovalOutcome::Approved => "approved",
        ApprovalOutcome::Denied => "denied",
        ApprovalOutcome::Cancelled => "cancelled",
        ApprovalOutcome::TimedOut => "timed out",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_line("  hello there \n").unwrap(),
            ConsoleCommand::Message("hello there".into())
        );
        assert_eq!(parse_line("   ").unwrap(), ConsoleCommand::Empty);
    }

    #[test]
    fn tool_takes_optional_json() {
        assert_eq!(
            parse_line("/tool read_file {\"path\": \"a.txt\"}").unwrap(),
            ConsoleCommand::Tool {
                name: "read_file".into(),
                params: json!({"path": "a.txt"}),
            }
        );
        assert_eq!(
            parse_line("/tool list").unwrap(),
            ConsoleCommand::Tool {
                name: "list".into(),
                params: json!({}),
            }
        );
        assert!(matches!(
            parse_line("/tool x {oops"),
            Err(CommandError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_line("/tool"),
            Err(CommandError::MissingArgument { command: "tool", .. })
        ));
    }

    #[test]
    fn approval_commands() {
        assert_eq!(
            parse_line("/approve r1 remember").unwrap(),
            ConsoleCommand::Approve {
                id: "r1".into(),
                remember: true,
            }
        );
        assert_eq!(
            parse_line("/approve r1").unwrap(),
            ConsoleCommand::Approve {
                id: "r1".into(),
                remember: false,
            }
        );
        assert_eq!(
            parse_line("/deny r1").unwrap(),
            ConsoleCommand::Deny { id: "r1".into() }
        );
        assert!(parse_line("/deny").is_err());
    }

    #[test]
    fn unknown_command_is_reported() {
        assert_eq!(
            parse_line("/frobnicate now"),
            Err(CommandError::Unknown("frobnicate".into()))
        );
        assert_eq!(parse_line("/quit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn reply_text_prefers_content() {
        assert_eq!(reply_text(&json!({"content": "hi", "tool_calls": []})), "hi");
        assert_eq!(reply_text(&json!("plain")), "plain");
        assert_eq!(reply_text(&json!({"other": 1})), "{\"other\":1}");
    }
}
