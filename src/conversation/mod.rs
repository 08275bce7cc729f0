//! Conversation types and state management

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in a conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,

    /// User feedback: `Some(true)` liked, `Some(false)` disliked, `None` unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liked: Option<bool>,

    /// For assistant messages, the user message that triggered them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_user_message_id: Option<String>,

    #[serde(default = "delivered_by_default")]
    pub is_delivered: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
}

fn delivered_by_default() -> bool {
    true
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            text: text.into(),
            liked: None,
            original_user_message_id: None,
            is_delivered: true,
            image_uri: None,
        }
    }

    /// An empty assistant message awaiting its completion
    pub fn pending_reply(original_user_message_id: &str) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            text: String::new(),
            liked: None,
            original_user_message_id: Some(original_user_message_id.to_string()),
            is_delivered: false,
            image_uri: None,
        }
    }

    /// An assistant message that is already complete, e.g. a scan result
    pub fn delivered_reply(text: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            text: text.into(),
            liked: None,
            original_user_message_id: None,
            is_delivered: true,
            image_uri: None,
        }
    }

    pub fn with_image(mut self, image_uri: Option<String>) -> Self {
        self.image_uri = image_uri;
        self
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_delivered
    }
}

/// Role/content pair submitted to a completion service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        match message.role {
            Role::User => ChatTurn::user(message.text.clone()),
            Role::Assistant => ChatTurn::assistant(message.text.clone()),
        }
    }
}

/// Index entry for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub date: String,
}

impl ConversationSummary {
    /// Summary for a conversation created now, with a fresh id
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: next_conversation_id(now),
            title: None,
            date: display_date(now),
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            date: display_date(Utc::now()),
        }
    }

    /// Entry rebuilt for a log that has no index entry. The creation date
    /// comes from the timestamp id when it is one.
    pub fn recovered(id: &str, title: &str) -> Self {
        let created = id
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Self {
            id: id.to_string(),
            title: Some(title.to_string()),
            date: display_date(created),
        }
    }
}

impl Default for ConversationSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// A conversation as presented to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub date: Option<String>,
    pub messages: Vec<Message>,
    pub is_generating: bool,
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

static LAST_CONVERSATION_ID: AtomicI64 = AtomicI64::new(0);

/// Millisecond timestamp id, bumped past the previous one when the clock
/// has not advanced so ids stay strictly increasing within the process.
pub fn next_conversation_id(now: DateTime<Utc>) -> String {
    let millis = now.timestamp_millis();
    let mut last = LAST_CONVERSATION_ID.load(Ordering::SeqCst);
    loop {
        let candidate = if millis > last { millis } else { last + 1 };
        match LAST_CONVERSATION_ID.compare_exchange(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}

pub fn display_date(at: DateTime<Utc>) -> String {
    at.format("%b %-d, %Y").to_string()
}
