//! Chat commands.
//!
//! Only messages starting with `!` are considered. Parsing is pure; the
//! bridge applies rate limits and runs the command.

use avaconf::{GiftAction, Permission};
use serde::{Deserialize, Serialize};

pub const COMMAND_PREFIX: char = '!';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "username", alias = "uniqueId")]
    pub user: String,
    #[serde(alias = "comment", alias = "message")]
    pub text: String,
    #[serde(default)]
    pub is_subscriber: bool,
    #[serde(default)]
    pub is_moderator: bool,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
            is_subscriber: false,
            is_moderator: false,
        }
    }

    /// The highest role this chatter holds.
    pub fn role(&self) -> Permission {
        if self.is_moderator {
            Permission::Moderator
        } else if self.is_subscriber {
            Permission::Subscriber
        } else {
            Permission::All
        }
    }

    pub fn has(&self, required: Permission) -> bool {
        self.role() >= required
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// `!avatar <name>`
    Avatar(String),
    /// `!avatars`
    ListAvatars,
    /// `!wave`, `!dance`, `!celebrate`, `!hearts`, `!confetti`
    Action(GiftAction),
    /// `!emote <n>`
    Emote(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Not a command at all; ignore silently.
    NotCommand,
    Unknown(String),
    /// A known command with bad arguments; carries the usage reply.
    Usage(&'static str),
}

impl ChatCommand {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let Some(body) = text.trim().strip_prefix(COMMAND_PREFIX) else {
            return Err(ParseError::NotCommand);
        };
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "avatar" if rest.is_empty() => Err(ParseError::Usage("Usage: !avatar <name>")),
            "avatar" => Ok(ChatCommand::Avatar(rest.to_string())),
            "avatars" => Ok(ChatCommand::ListAvatars),
            "emote" => rest
                .parse::<i32>()
                .map(ChatCommand::Emote)
                .map_err(|_| ParseError::Usage("Usage: !emote <0-7>")),
            "wave" => Ok(ChatCommand::Action(GiftAction::Wave)),
            "dance" => Ok(ChatCommand::Action(GiftAction::Dance)),
            "celebrate" => Ok(ChatCommand::Action(GiftAction::Celebrate)),
            "hearts" => Ok(ChatCommand::Action(GiftAction::Hearts)),
            "confetti" => Ok(ChatCommand::Action(GiftAction::Confetti)),
            "" => Err(ParseError::NotCommand),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}
