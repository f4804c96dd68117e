// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `!`-prefix command handling. A matched command never reaches the agent;
//! it produces a `command_executed` connector event instead of a message.

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

/// Parse `text` as a command under `prefix`. Returns `None` for ordinary
/// messages (including the bare prefix with no command name).
pub fn parse_command(prefix: &str, text: &str) -> Option<ParsedCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next()?.to_ascii_lowercase();
    Some(ParsedCommand {
        name,
        args: words.map(String::from).collect(),
    })
}

/// Help text posted for `help` and for unknown commands.
pub fn help_text(prefix: &str) -> String {
    format!(
        "Available commands:\n\
         • `{prefix}help` — show this message\n\
         • `{prefix}reset` — clear this channel's conversation and start fresh\n\
         • `{prefix}status` — show fleet status"
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_messages_are_not_commands() {
        assert!(parse_command("!", "hello there").is_none());
        assert!(parse_command("!", "").is_none());
    }

    #[test]
    fn bare_prefix_is_not_a_command() {
        assert!(parse_command("!", "!").is_none());
        assert!(parse_command("!", "!   ").is_none());
    }

    #[test]
    fn commands_parse_name_and_args() {
        let cmd = parse_command("!", "!reset now please").unwrap();
        assert_eq!(cmd.name, "reset");
        assert_eq!(cmd.args, vec!["now", "please"]);
    }

    #[test]
    fn command_names_are_case_insensitive() {
        assert_eq!(parse_command("!", "!HELP").unwrap().name, "help");
    }

    #[test]
    fn custom_prefixes_are_honoured() {
        assert!(parse_command("/", "!reset").is_none());
        assert_eq!(parse_command("/", "/status").unwrap().name, "status");
    }

    #[test]
    fn leading_whitespace_is_tolerated() {
        assert_eq!(parse_command("!", "  !help").unwrap().name, "help");
    }
}
