//! Serde schemas for every record kept in the replicated graph.
//!
//! Field names are camelCase on the wire because that is what the existing
//! clients write.  Parsing is deliberately lenient: anything beyond the
//! required fields is optional, unknown fields are ignored, and a record
//! that fails to deserialize is simply skipped by its consumer.  Write-side
//! constructors fill only the fields that belong to the record being
//! written, so merge-writes never clobber sibling fields with nulls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{now_millis, Alias, CallId, DeviceId, GroupId};

// ---------------------------------------------------------------------------
// Call signaling
// ---------------------------------------------------------------------------

/// Which signaling step a call record currently represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Offer,
    Answer,
    Reject,
    End,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallKind::Offer => "offer",
            CallKind::Answer => "answer",
            CallKind::Reject => "reject",
            CallKind::End => "end",
        };
        write!(f, "{s}")
    }
}

/// The single mutable record at `calls/{callId}`.  Each signaling step
/// merges into it, so after an answer the record still carries the offer
/// fields and `type` reflects the latest step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(rename = "type")]
    pub kind: CallKind,
    /// Initiating party.
    pub from: Alias,
    /// Addressed party.  Every step names the peer it is aimed at.
    pub to: Alias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    /// SDP type of the offer, `"offer"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_sdp: Option<String>,
    /// SDP type of the answer, `"answer"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video: Option<bool>,
    /// Signaling lifecycle status; `"connecting"` while the offer stands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Set (as a leaf write) once a call push went out.  Never written as
    /// part of a signaling step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified: Option<bool>,
}

impl CallRecord {
    pub fn offer(call_id: &CallId, from: &Alias, to: &Alias, sdp: String, is_video: bool) -> Self {
        Self {
            kind: CallKind::Offer,
            from: from.clone(),
            to: to.clone(),
            call_id: Some(call_id.clone()),
            offer_type: Some("offer".to_string()),
            offer_sdp: Some(sdp),
            answer_type: None,
            answer_sdp: None,
            is_video: Some(is_video),
            status: Some(crate::constants::CALL_STATUS_CONNECTING.to_string()),
            start_time: Some(now_millis()),
            time: None,
            end_time: None,
            notified: None,
        }
    }

    pub fn answer(call_id: &CallId, from: &Alias, to: &Alias, sdp: String) -> Self {
        Self {
            kind: CallKind::Answer,
            from: from.clone(),
            to: to.clone(),
            call_id: Some(call_id.clone()),
            offer_type: None,
            offer_sdp: None,
            answer_type: Some("answer".to_string()),
            answer_sdp: Some(sdp),
            is_video: None,
            status: None,
            start_time: None,
            time: Some(now_millis()),
            end_time: None,
            notified: None,
        }
    }

    pub fn reject(from: &Alias, to: &Alias) -> Self {
        Self {
            kind: CallKind::Reject,
            from: from.clone(),
            to: to.clone(),
            call_id: None,
            offer_type: None,
            offer_sdp: None,
            answer_type: None,
            answer_sdp: None,
            is_video: None,
            status: None,
            start_time: None,
            time: Some(now_millis()),
            end_time: None,
            notified: None,
        }
    }

    pub fn end(from: &Alias, to: &Alias) -> Self {
        Self {
            kind: CallKind::End,
            from: from.clone(),
            to: to.clone(),
            call_id: None,
            offer_type: None,
            offer_sdp: None,
            answer_type: None,
            answer_sdp: None,
            is_video: None,
            status: None,
            start_time: None,
            time: None,
            end_time: Some(now_millis()),
            notified: None,
        }
    }

    pub fn was_notified(&self) -> bool {
        self.notified.unwrap_or(false)
    }

    /// True for the record shape that triggers a call push: a standing
    /// offer that has not been answered or torn down.
    pub fn is_connecting_offer(&self) -> bool {
        self.kind == CallKind::Offer
            && self.status.as_deref() == Some(crate::constants::CALL_STATUS_CONNECTING)
    }
}

/// A single ICE candidate in the shape WebRTC serializes it to JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Append-only record under `calls/{callId}/iceCandidates/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceRecord {
    /// Emitting party, used to skip candidates echoed back to their author.
    pub from: Alias,
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl IceRecord {
    pub fn new(from: &Alias, candidate: IceCandidate) -> Self {
        Self {
            from: from.clone(),
            candidate,
            timestamp: Some(now_millis()),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

/// A chat message at `chats/{chatId}/{messageId}` or
/// `groupChats/{groupId}/{messageId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub sender: Alias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Opaque file envelope for `type:"file"` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Flipped false to true exactly once, after a successful push.
    #[serde(default)]
    pub notified: bool,
}

impl MessageRecord {
    /// The notification body for this message, `None` when the record is
    /// too incomplete to present.
    pub fn preview(&self) -> Option<String> {
        match self.kind {
            MessageKind::File => Some("Sent a file".to_string()),
            MessageKind::Text => self.content.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Group metadata at `groups/{groupId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Alias>,
    /// Membership map `alias -> true`.  Carries the store-internal `_`
    /// metadata key, which is never a recipient.
    #[serde(default)]
    pub members: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl GroupRecord {
    /// Current members except the given sender and the `_` metadata key.
    pub fn recipients(&self, sender: &Alias) -> Vec<Alias> {
        self.members
            .iter()
            .filter(|(k, v)| {
                k.as_str() != crate::constants::STORE_META_KEY
                    && k.as_str() != sender.as_str()
                    && matches!(v, Value::Bool(true))
            })
            .map(|(k, _)| Alias::from(k.as_str()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Browser push subscription, exactly as `PushManager.subscribe` hands it
/// out: the provider endpoint plus the client key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    pub endpoint: String,
    #[serde(default)]
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p256dh: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

/// A registered device at `users/{alias}/devices/{deviceId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<PushSubscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

// ---------------------------------------------------------------------------
// One-shot notifications
// ---------------------------------------------------------------------------

/// `users/{alias}/contactRequests/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequestRecord {
    pub from: Alias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Set by the recipient once they acted on the request.
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub notified: bool,
}

/// `users/{alias}/contactAcceptances/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactAcceptanceRecord {
    pub from: Alias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub notified: bool,
}

/// `users/{alias}/groupInvitations/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvitationRecord {
    pub group_id: GroupId,
    pub from: Alias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub handled: bool,
    #[serde(default)]
    pub notified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_record_parses_wire_shape() {
        let value = json!({
            "type": "offer",
            "callId": "1713200000000",
            "from": "ada",
            "to": "zoe",
            "offerType": "offer",
            "offerSdp": "v=0...",
            "isVideo": false,
            "status": "connecting",
            "startTime": 1713200000000i64
        });
        let record: CallRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.kind, CallKind::Offer);
        assert!(record.is_connecting_offer());
        assert!(!record.was_notified());
    }

    #[test]
    fn test_call_record_missing_parties_is_rejected() {
        let value = json!({ "type": "offer", "from": "ada" });
        assert!(serde_json::from_value::<CallRecord>(value).is_err());
    }

    #[test]
    fn test_answer_serialization_omits_offer_fields() {
        let record = CallRecord::answer(
            &CallId("1".to_string()),
            &Alias::from("zoe"),
            &Alias::from("ada"),
            "v=0...".to_string(),
        );
        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["type"], "answer");
        assert!(!obj.contains_key("offerSdp"));
        assert!(!obj.contains_key("notified"));
    }

    #[test]
    fn test_message_preview() {
        let text: MessageRecord = serde_json::from_value(json!({
            "sender": "ada",
            "content": "hello",
            "timestamp": 1i64
        }))
        .unwrap();
        assert_eq!(text.preview().as_deref(), Some("hello"));

        let file: MessageRecord = serde_json::from_value(json!({
            "sender": "ada",
            "type": "file",
            "file": { "name": "cat.png" }
        }))
        .unwrap();
        assert_eq!(file.preview().as_deref(), Some("Sent a file"));
    }

    #[test]
    fn test_group_recipients_skip_sender_and_meta() {
        let group: GroupRecord = serde_json::from_value(json!({
            "name": "book club",
            "creator": "ada",
            "members": { "ada": true, "zoe": true, "eve": true, "_": {"#": "groups/g1"} }
        }))
        .unwrap();
        let mut recipients = group.recipients(&Alias::from("ada"));
        recipients.sort();
        assert_eq!(recipients, vec![Alias::from("eve"), Alias::from("zoe")]);
    }

    #[test]
    fn test_ice_candidate_wire_names() {
        let ice = IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let value = serde_json::to_value(&ice).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("sdpMid"));
        assert!(obj.contains_key("sdpMLineIndex"));
    }
}
