//! JSON frames exchanged with the protocol sidecar.

use serde::{Deserialize, Serialize};
use wab_core::messaging::types::{CloseReason, InboundMessage, OutboundPayload};

/// Provider status code for an explicit logout.
pub const STATUS_LOGGED_OUT: u16 = 401;
/// Provider status code for an unusable session.
pub const STATUS_BAD_SESSION: u16 = 500;

/// Sidecar -> bot.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    Qr {
        qr: String,
    },
    Connected {
        #[serde(default)]
        jid: Option<String>,
        #[serde(default)]
        is_new_login: bool,
    },
    Disconnected {
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Credentials {
        creds: serde_json::Value,
    },
    InboundMessage {
        message: InboundMessage,
    },
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    GroupAdmins {
        request_id: String,
        #[serde(default)]
        admins: Vec<String>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Message decryption failed (e.g. authentication tag mismatch).
    DecryptError {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SidecarMessage {
    /// Correlation id for replies to a bot request.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SidecarMessage::SendResult { request_id, .. }
            | SidecarMessage::GroupAdmins { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Bot -> sidecar.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        creds: Option<serde_json::Value>,
    },
    Send {
        request_id: String,
        to: String,
        payload: OutboundPayload,
    },
    GroupAdmins {
        request_id: String,
        jid: String,
    },
    Disconnect,
}

/// Map a sidecar disconnect report onto the supervisor's failure classes.
pub fn classify_disconnect(status_code: Option<u16>, reason: Option<&str>) -> CloseReason {
    let why = reason.unwrap_or("connection closed").to_string();
    match status_code {
        Some(STATUS_LOGGED_OUT) => CloseReason::LoggedOut,
        Some(STATUS_BAD_SESSION) => CloseReason::SessionCorrupt(why),
        _ if looks_corrupt(&why) => CloseReason::SessionCorrupt(why),
        Some(code) => CloseReason::Recoverable(format!("{why} (status {code})")),
        None => CloseReason::Recoverable(why),
    }
}

fn looks_corrupt(reason: &str) -> bool {
    let r = reason.to_lowercase();
    ["bad mac", "bad session", "auth tag", "invalid session"]
        .iter()
        .any(|needle| r.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_disconnect_and_replies() {
        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "disconnected",
            "status_code": 428,
            "reason": "Connection Closed"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            SidecarMessage::Disconnected {
                status_code: Some(428),
                ..
            }
        ));

        let reply: SidecarMessage = serde_json::from_value(json!({
            "type": "send_result",
            "request_id": "r1",
            "success": true
        }))
        .unwrap();
        assert_eq!(reply.request_id(), Some("r1"));
    }

    #[test]
    fn send_frame_nests_tagged_payload() {
        let frame = GatewayMessage::Send {
            request_id: "r1".into(),
            to: "1555@s.whatsapp.net".into(),
            payload: OutboundPayload::text("hi"),
        };
        assert_eq!(
            serde_json::to_value(frame).unwrap(),
            json!({
                "type": "send",
                "request_id": "r1",
                "to": "1555@s.whatsapp.net",
                "payload": {"type": "text", "text": "hi"}
            })
        );
        assert_eq!(
            serde_json::to_value(GatewayMessage::Connect { creds: None }).unwrap(),
            json!({"type": "connect"})
        );
    }

    #[test]
    fn disconnect_classification() {
        assert_eq!(classify_disconnect(Some(401), None), CloseReason::LoggedOut);
        assert!(matches!(
            classify_disconnect(Some(500), None),
            CloseReason::SessionCorrupt(_)
        ));
        assert!(matches!(
            classify_disconnect(Some(428), Some("Bad MAC in stream")),
            CloseReason::SessionCorrupt(_)
        ));
        assert_eq!(
            classify_disconnect(Some(515), Some("restart required")),
            CloseReason::Recoverable("restart required (status 515)".into())
        );
        assert_eq!(
            classify_disconnect(None, None),
            CloseReason::Recoverable("connection closed".into())
        );
    }
}
