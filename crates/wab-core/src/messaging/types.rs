use serde::{Deserialize, Serialize};

use crate::{
    credentials::Credentials,
    domain::{Jid, MessageId},
};

/// Events emitted by a transport connection attempt.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Handshake completed; `own_id` is the authenticated account, when known.
    Opened { own_id: Option<Jid> },
    Closed(CloseReason),
    Inbound(InboundMessage),
    CredentialsUpdated(Credentials),
    /// Pairing payload (QR contents) the operator has to scan.
    PairingCode(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Network drop, stream error, server restart request.
    Recoverable(String),
    /// The session was explicitly logged out on the provider side.
    LoggedOut,
    /// Authentication/integrity failure: the stored credential is unusable.
    SessionCorrupt(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    /// Protocol-internal message (revokes, key distribution, ...).
    Protocol,
    /// Envelope without any message content.
    #[default]
    Empty,
}

impl MessageKind {
    /// Whether this is a user-authored chat message.
    pub fn is_chat(self) -> bool {
        !matches!(self, MessageKind::Protocol | MessageKind::Empty)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub id: MessageId,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
}

/// Inbound chat envelope, already decoded by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    pub chat: Jid,
    pub sender: Jid,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    /// Text body or media caption.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quoted: Option<QuotedMessage>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Outgoing message content. Media is referenced by URL or local path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Audio {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mimetype: Option<String>,
    },
    Document {
        url: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mimetype: Option<String>,
    },
    Sticker {
        url: String,
    },
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundPayload::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundPayload::Text { .. } => "text",
            OutboundPayload::Image { .. } => "image",
            OutboundPayload::Video { .. } => "video",
            OutboundPayload::Audio { .. } => "audio",
            OutboundPayload::Document { .. } => "document",
            OutboundPayload::Sticker { .. } => "sticker",
        }
    }
}
