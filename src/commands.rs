//! Admin command parsing.
//!
//! Commands are plain `!`-prefixed messages from the admin user. Anything
//! that doesn't parse as a command is treated as a prompt for the worker.

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Cancel the thread's in-flight request.
    Cancel,
    /// Reset the thread's session (fresh session id, history forgotten).
    Reset,
    /// Report session / gateway status.
    Status,
    /// Set the thread's model override; `None` shows the current model,
    /// `Some("default")` clears the override.
    Model(Option<String>),
}

#[derive(Debug, Clone, Copy)]
struct CommandDef {
    keyword: &'static str,
    description: &'static str,
    takes_argument: bool,
}

const COMMAND_DEFS: &[CommandDef] = &[
    CommandDef {
        keyword: "!cancel",
        description: "Cancel the running request",
        takes_argument: false,
    },
    CommandDef {
        keyword: "!reset",
        description: "Start this thread's session over",
        takes_argument: false,
    },
    CommandDef {
        keyword: "!status",
        description: "Show session status",
        takes_argument: false,
    },
    CommandDef {
        keyword: "!model",
        description: "Show or set the model (e.g. `!model opus`)",
        takes_argument: true,
    },
];

/// One-line usage summary, sent when the gateway comes online.
pub fn command_help() -> String {
    COMMAND_DEFS
        .iter()
        .map(|def| format!("`{}` {}", def.keyword, def.description))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Parses an admin command from message text.
///
/// Returns `None` for anything that isn't one: the caller forwards those to
/// the worker as prompts.
pub fn parse_command(text: &str) -> Option<AdminCommand> {
    let trimmed = text.trim();
    if !trimmed.starts_with('!') {
        return None;
    }

    let (keyword, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (trimmed, ""),
    };

    let def = COMMAND_DEFS.iter().find(|def| def.keyword == keyword)?;
    if !rest.is_empty() && !def.takes_argument {
        return None;
    }

    Some(match def.keyword {
        "!cancel" => AdminCommand::Cancel,
        "!reset" => AdminCommand::Reset,
        "!status" => AdminCommand::Status,
        "!model" => AdminCommand::Model((!rest.is_empty()).then(|| rest.to_string())),
        _ => unreachable!("keyword not in COMMAND_DEFS"),
    })
}
