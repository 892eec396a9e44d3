//! Bus message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of inter-agent message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Unsolicited advice (e.g. a roadmap change the planner might make)
    Suggestion,
    /// A question that expects an answer
    ClarificationRequest,
    /// The answer to a clarification request
    ClarificationResponse,
    /// Status or escalation report
    Report,
    /// Notice that a stage passed review and can advance
    AutoAdvanceRequest,
}

impl MessageKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Suggestion => "suggestion",
            Self::ClarificationRequest => "clarification_request",
            Self::ClarificationResponse => "clarification_response",
            Self::Report => "report",
            Self::AutoAdvanceRequest => "auto_advance_request",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            "suggestion" => Some(Self::Suggestion),
            "clarification_request" => Some(Self::ClarificationRequest),
            "clarification_response" => Some(Self::ClarificationResponse),
            "report" => Some(Self::Report),
            "auto_advance_request" => Some(Self::AutoAdvanceRequest),
            _ => None,
        }
    }

    /// Kind used for a reply to a message of this kind
    pub fn response_kind(&self) -> Self {
        match self {
            Self::ClarificationRequest => Self::ClarificationResponse,
            other => *other,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message between agent roles. Immutable once sent except for the
/// `read` and `answered` flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub run_id: String,
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    pub subject: String,
    pub body: String,
    pub requires_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub read: bool,
    pub answered: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A request that still blocks on an answer
    pub fn is_pending_request(&self) -> bool {
        self.requires_response && !self.answered
    }
}

/// Filter for polling the bus
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub kind: Option<MessageKind>,
    pub from: Option<String>,
    pub unread_only: bool,
}

impl MessageFilter {
    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn from(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn unread(mut self) -> Self {
        self.unread_only = true;
        self
    }
}
