//! Inbound platform events.
//!
//! A transport adapter turns whatever its platform delivers (a message, a
//! button click, a payment notification) into an [`InboundEvent`] and hands
//! it to the dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Stable identifier of one end-user chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Create a conversation id from a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a conversation id scoped to a channel, e.g. `telegram:42`.
    pub fn scoped(channel: &str, chat_id: impl fmt::Display) -> Self {
        Self(format!("{channel}:{chat_id}"))
    }

    /// Borrow the raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of file attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Image sent as a photo.
    Photo,
    /// Document or any other file.
    Document,
    /// Audio file or voice message.
    Audio,
    /// Video file.
    Video,
    /// Sticker.
    Sticker,
}

/// File attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment kind.
    pub kind: AttachmentKind,
    /// Platform file identifier or URL.
    pub file_id: String,
    /// Optional MIME type.
    pub mime_type: Option<String>,
    /// Optional file name.
    pub file_name: Option<String>,
    /// File size in bytes, if known.
    pub file_size: Option<u64>,
}

impl Attachment {
    /// Create an attachment of the given kind.
    pub fn new(kind: AttachmentKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            mime_type: None,
            file_name: None,
            file_size: None,
        }
    }

    /// Create a photo attachment.
    pub fn photo(file_id: impl Into<String>) -> Self {
        Self::new(AttachmentKind::Photo, file_id)
    }

    /// Create a document attachment.
    pub fn document(file_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            ..Self::new(AttachmentKind::Document, file_id)
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// A user-authored message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Platform message id.
    pub message_id: String,
    /// Text or caption, if any.
    pub text: Option<String>,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageContent {
    /// First attachment of the given kind.
    #[must_use]
    pub fn attachment(&self, kind: AttachmentKind) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.kind == kind)
    }
}

/// A "button clicked" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    /// Platform query id, used to acknowledge the click.
    pub query_id: String,
    /// Token that was attached to the clicked button.
    pub token: String,
    /// Id of the message (surface) that carried the button.
    pub message_id: String,
}

/// A "payment completed" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// ISO 4217 currency code.
    pub currency: String,
    /// Amount in the smallest currency unit.
    pub total_amount: u64,
    /// Application payload attached to the invoice.
    pub payload: String,
    /// Provider-side charge id.
    pub provider_charge_id: Option<String>,
}

/// What an inbound event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Text, command or attachment message.
    Message(MessageContent),
    /// Button click.
    Callback(CallbackQuery),
    /// Completed payment.
    Payment(Payment),
}

/// An inbound event from a transport adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Conversation this event belongs to.
    pub conversation: ConversationId,
    /// Sender's identifier within the platform.
    pub sender_id: String,
    /// When the platform produced the event.
    pub timestamp: SystemTime,
    /// Event payload.
    pub kind: EventKind,
}

impl InboundEvent {
    fn new(conversation: ConversationId, sender_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            conversation,
            sender_id: sender_id.into(),
            timestamp: SystemTime::now(),
            kind,
        }
    }

    /// Create a text message event.
    pub fn text(
        conversation: impl Into<ConversationId>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(
            conversation.into(),
            sender_id,
            EventKind::Message(MessageContent {
                message_id: crate::util::generate_id("msg"),
                text: Some(text.into()),
                attachments: Vec::new(),
            }),
        )
    }

    /// Create a message event carrying one attachment.
    pub fn attachment(
        conversation: impl Into<ConversationId>,
        sender_id: impl Into<String>,
        attachment: Attachment,
    ) -> Self {
        Self::new(
            conversation.into(),
            sender_id,
            EventKind::Message(MessageContent {
                message_id: crate::util::generate_id("msg"),
                text: None,
                attachments: vec![attachment],
            }),
        )
    }

    /// Create a button-click event.
    pub fn callback(
        conversation: impl Into<ConversationId>,
        sender_id: impl Into<String>,
        token: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self::new(
            conversation.into(),
            sender_id,
            EventKind::Callback(CallbackQuery {
                query_id: crate::util::generate_id("query"),
                token: token.into(),
                message_id: message_id.into(),
            }),
        )
    }

    /// Create a payment-completed event.
    pub fn payment(
        conversation: impl Into<ConversationId>,
        sender_id: impl Into<String>,
        payment: Payment,
    ) -> Self {
        Self::new(conversation.into(), sender_id, EventKind::Payment(payment))
    }

    /// Override the event timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The callback query, if this is a button click.
    #[must_use]
    pub fn callback_query(&self) -> Option<&CallbackQuery> {
        match &self.kind {
            EventKind::Callback(query) => Some(query),
            _ => None,
        }
    }

    /// Short label used in logs.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::Message(_) => "message",
            EventKind::Callback(_) => "callback",
            EventKind::Payment(_) => "payment",
        }
    }
}
