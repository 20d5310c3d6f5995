//! Conversation messages
//!
//! In memory a message is either a real entry or a pending placeholder
//! awaiting a bot reply. Only real entries have a durable/wire form.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session identifier (`session_<unix-millis>`)
pub type SessionId = String;

/// Ordered messages of one session
pub type Conversation = Vec<Message>;

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// Token locating a placeholder until its reply arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaceholderToken(Uuid);

impl PlaceholderToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlaceholderToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thinking-{}", self.0)
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Real { sender: Sender, text: String },
    Pending { token: PlaceholderToken },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::Real {
            sender: Sender::User,
            text: text.into(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Message::Real {
            sender: Sender::Bot,
            text: text.into(),
        }
    }

    pub fn pending(token: PlaceholderToken) -> Self {
        Message::Pending { token }
    }

    /// Placeholders always render on the bot side
    pub fn sender(&self) -> Sender {
        match self {
            Message::Real { sender, .. } => *sender,
            Message::Pending { .. } => Sender::Bot,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Message::Real { text, .. } => text,
            Message::Pending { .. } => "",
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Message::Pending { .. })
    }

    pub fn placeholder_token(&self) -> Option<PlaceholderToken> {
        match self {
            Message::Pending { token } => Some(*token),
            Message::Real { .. } => None,
        }
    }

    /// Durable form, `None` for placeholders
    pub fn to_stored(&self) -> Option<StoredMessage> {
        match self {
            Message::Real { sender, text } => Some(StoredMessage {
                sender: *sender,
                text: text.clone(),
            }),
            Message::Pending { .. } => None,
        }
    }
}

/// `{sender, text}` as persisted locally and returned by the history endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: Sender,
    pub text: String,
}

impl From<StoredMessage> for Message {
    fn from(m: StoredMessage) -> Self {
        Message::Real {
            sender: m.sender,
            text: m.text,
        }
    }
}

/// Return a copy of `conversation` with the placeholder for `token`
/// swapped for `resolved` at the same position.
///
/// `None` when no placeholder carries `token`.
pub fn replace(
    conversation: &[Message],
    token: PlaceholderToken,
    resolved: Message,
) -> Option<Conversation> {
    let idx = conversation
        .iter()
        .position(|m| m.placeholder_token() == Some(token))?;

    let mut next = conversation.to_vec();
    next[idx] = resolved;
    Some(next)
}

pub fn has_pending(conversation: &[Message]) -> bool {
    conversation.iter().any(Message::is_placeholder)
}

/// Durable snapshot of a conversation (placeholders dropped)
pub fn to_stored(conversation: &[Message]) -> Vec<StoredMessage> {
    conversation.iter().filter_map(Message::to_stored).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_keeps_position() {
        let token = PlaceholderToken::new();
        let conv = vec![
            Message::user("hi"),
            Message::pending(token),
            Message::user("still there?"),
        ];

        let next = replace(&conv, token, Message::bot("hello")).unwrap();
        assert_eq!(next[1], Message::bot("hello"));
        assert_eq!(next.len(), 3);
        assert!(!has_pending(&next));
        // original untouched
        assert!(conv[1].is_placeholder());
    }

    #[test]
    fn test_replace_only_matching_token() {
        let a = PlaceholderToken::new();
        let b = PlaceholderToken::new();
        let conv = vec![Message::pending(a), Message::pending(b)];

        let next = replace(&conv, b, Message::bot("for b")).unwrap();
        assert_eq!(next[0], Message::pending(a));
        assert_eq!(next[1], Message::bot("for b"));
    }

    #[test]
    fn test_replace_missing_token() {
        let conv = vec![Message::user("hi")];
        assert!(replace(&conv, PlaceholderToken::new(), Message::bot("x")).is_none());
    }

    #[test]
    fn test_stored_snapshot_drops_placeholders() {
        let conv = vec![Message::user("hi"), Message::pending(PlaceholderToken::new())];
        let stored = to_stored(&conv);
        assert_eq!(
            stored,
            vec![StoredMessage {
                sender: Sender::User,
                text: "hi".into()
            }]
        );
    }

    #[test]
    fn test_sender_wire_format() {
        let json = serde_json::to_string(&StoredMessage {
            sender: Sender::Bot,
            text: "ok".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"sender":"bot","text":"ok"}"#);
    }
}
