//! Slash commands typed at the prompt.
//!
//! | input              | command                      |
//! |--------------------|------------------------------|
//! | `/coder`           | toggle escalation (Ctrl+E)   |
//! | `/back [summary]`  | return from escalation       |
//! | `/load <agent>`    | load another agent           |
//! | `/graph <id>`      | switch the focused graph     |
//! | `/pause`           | pause the current execution  |
//! | `/logs`            | toggle inline log lines      |
//! | `/quit`            | shut down                    |
//! | anything else      | submitted to the agent       |

use coordination::notify::{Notification, Notifier};
use coordination::session::SessionCommand;

use crate::config::DashboardConfig;

pub const HELP: &str = "\
/coder            escalate to the coder agent, or return if escalated
/back [summary]   return from the coder agent
/load <agent>     load an agent by name or path
/graph <id>       switch the focused graph
/pause            pause the current execution
/logs             toggle inline log lines
/quit             shut down
/help             show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(SessionCommand),
    Help,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),

    #[error("/{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}

/// Turn one line of user input into a session command.
pub fn parse_line(line: &str, config: &DashboardConfig) -> Result<Input, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Input::Command(SessionCommand::Submit(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "coder" => SessionCommand::ToggleEscalation,
        "back" => SessionCommand::Return {
            summary: (!arg.is_empty()).then(|| arg.to_string()),
        },
        "load" => {
            if arg.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "load",
                    argument: "an agent name or path",
                });
            }
            SessionCommand::LoadAgent(config.resolve_agent(arg))
        }
        "graph" => {
            if arg.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "graph",
                    argument: "a graph id",
                });
            }
            SessionCommand::SwitchGraph(arg.to_string())
        }
        "pause" => SessionCommand::Pause,
        "logs" => SessionCommand::ToggleLogs,
        "quit" | "exit" => SessionCommand::Shutdown,
        "help" => return Ok(Input::Help),
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(Input::Command(command))
}

/// Parse `line` for the session loop. Help text and parse errors go to
/// `notifier` so they never interleave with the rendered screen.
pub fn route_line(
    line: &str,
    config: &DashboardConfig,
    notifier: &dyn Notifier,
) -> Option<SessionCommand> {
    match parse_line(line, config) {
        Ok(Input::Command(command)) => Some(command),
        Ok(Input::Help) => {
            notifier.notify(Notification::information(HELP).timeout_secs(10));
            None
        }
        Ok(Input::Empty) => None,
        Err(e) => {
            notifier.notify(Notification::warning(e.to_string()));
            None
        }
    }
}
