//! Push notification payloads.
//!
//! The payload is what the service worker on the receiving device unpacks:
//! a kind, the rendered title/body, and a `data` object that carries enough
//! context for client-side action routing (opening the right chat, mapping
//! accept/decline onto a call).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::records::{CallRecord, GroupInvitationRecord, MessageRecord};
use crate::types::{now_millis, Alias, CallId, GroupId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Chat,
    Group,
    Call,
    ContactRequest,
    GroupInvitation,
    ContactAcceptance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Value,
}

impl NotificationPayload {
    pub fn chat(sender: &Alias, body: String) -> Self {
        Self {
            kind: NotificationKind::Chat,
            title: format!("Message from {sender}"),
            body,
            data: json!({ "type": "chat", "from": sender }),
        }
    }

    pub fn group(group_id: &GroupId, group_name: &str, message: &MessageRecord, preview: String) -> Self {
        Self {
            kind: NotificationKind::Group,
            title: group_name.to_string(),
            body: format!("{}: {preview}", message.sender),
            data: json!({ "type": "group", "groupId": group_id, "from": message.sender }),
        }
    }

    /// Payload for an incoming offer.  Carries the SDP so the client can
    /// answer straight from the notification's accept action.
    pub fn call(call_id: &CallId, record: &CallRecord) -> Self {
        let is_video = record.is_video.unwrap_or(false);
        let kind_word = if is_video { "Video" } else { "Voice" };
        Self {
            kind: NotificationKind::Call,
            title: format!("Incoming {kind_word} Call"),
            body: format!("{} is calling...", record.from),
            data: json!({
                "type": "call",
                "from": record.from,
                "callId": call_id,
                "isVideo": is_video,
                "offerSdp": record.offer_sdp,
                "offerType": record.offer_type,
                "timestamp": now_millis(),
            }),
        }
    }

    pub fn contact_request(from: &Alias, request_id: &str) -> Self {
        Self {
            kind: NotificationKind::ContactRequest,
            title: "New Contact Request".to_string(),
            body: format!("{from} wants to connect with you"),
            data: json!({ "type": "contactRequest", "from": from, "requestId": request_id }),
        }
    }

    pub fn contact_acceptance(from: &Alias) -> Self {
        Self {
            kind: NotificationKind::ContactAcceptance,
            title: "Contact Request Accepted".to_string(),
            body: format!("{from} has accepted your contact request!"),
            data: json!({ "type": "contactAcceptance", "from": from }),
        }
    }

    pub fn group_invitation(invitation: &GroupInvitationRecord) -> Self {
        let group_name = invitation.group_name.as_deref().unwrap_or("a group");
        Self {
            kind: NotificationKind::GroupInvitation,
            title: "Group Invitation".to_string(),
            body: format!(
                "{} invited you to join the group \"{group_name}\"",
                invitation.from
            ),
            data: json!({
                "type": "groupInvitation",
                "groupId": invitation.group_id,
                "from": invitation.from,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_payload_shape() {
        let payload = NotificationPayload::chat(&Alias::from("ada"), "hello".to_string());
        assert_eq!(payload.title, "Message from ada");
        assert_eq!(payload.body, "hello");
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["type"], "chat");
        assert_eq!(wire["data"]["from"], "ada");
    }

    #[test]
    fn test_call_payload_voice_vs_video() {
        let offer: CallRecord = serde_json::from_value(json!({
            "type": "offer",
            "from": "ada",
            "to": "zoe",
            "offerSdp": "v=0...",
            "offerType": "offer",
            "isVideo": true,
            "status": "connecting"
        }))
        .unwrap();
        let call_id = CallId("1713200000000".to_string());
        let payload = NotificationPayload::call(&call_id, &offer);
        assert_eq!(payload.title, "Incoming Video Call");
        assert_eq!(payload.body, "ada is calling...");
        assert_eq!(payload.data["callId"], "1713200000000");
        assert_eq!(payload.data["offerSdp"], "v=0...");
    }

    #[test]
    fn test_kind_wire_names() {
        let wire = serde_json::to_value(NotificationKind::ContactRequest).unwrap();
        assert_eq!(wire, "contactRequest");
        let wire = serde_json::to_value(NotificationKind::GroupInvitation).unwrap();
        assert_eq!(wire, "groupInvitation");
    }
}
