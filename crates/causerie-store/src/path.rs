use causerie_shared::{Alias, CallId, ChatId, DeviceId, GroupId};

/// A slash-separated location in the replicated graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('/')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    // -- Namespace constructors --

    pub fn calls() -> Self {
        Self::parse("calls")
    }

    pub fn call(id: &CallId) -> Self {
        Self::calls().child(id.as_str())
    }

    pub fn call_ice(id: &CallId) -> Self {
        Self::call(id).child("iceCandidates")
    }

    pub fn chats() -> Self {
        Self::parse("chats")
    }

    pub fn chat(id: &ChatId) -> Self {
        Self::chats().child(id.as_str())
    }

    pub fn chat_message(chat: &ChatId, message_id: &str) -> Self {
        Self::chat(chat).child(message_id)
    }

    pub fn group_chats() -> Self {
        Self::parse("groupChats")
    }

    pub fn group_chat(id: &GroupId) -> Self {
        Self::group_chats().child(id.as_str())
    }

    pub fn group_message(group: &GroupId, message_id: &str) -> Self {
        Self::group_chat(group).child(message_id)
    }

    pub fn groups() -> Self {
        Self::parse("groups")
    }

    pub fn group(id: &GroupId) -> Self {
        Self::groups().child(id.as_str())
    }

    pub fn users() -> Self {
        Self::parse("users")
    }

    pub fn user(alias: &Alias) -> Self {
        Self::users().child(alias.as_str())
    }

    pub fn user_devices(alias: &Alias) -> Self {
        Self::user(alias).child("devices")
    }

    pub fn user_device(alias: &Alias, device: &DeviceId) -> Self {
        Self::user_devices(alias).child(device.as_str())
    }

    pub fn contact_requests(alias: &Alias) -> Self {
        Self::user(alias).child("contactRequests")
    }

    pub fn contact_acceptances(alias: &Alias) -> Self {
        Self::user(alias).child("contactAcceptances")
    }

    pub fn group_invitations(alias: &Alias) -> Self {
        Self::user(alias).child("groupInvitations")
    }
}

impl std::fmt::Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<&str> for KeyPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = KeyPath::parse("chats/ada_zoe/m1");
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "chats/ada_zoe/m1");
        assert_eq!(KeyPath::parse("/calls/").to_string(), "calls");
    }

    #[test]
    fn test_child_and_parent() {
        let base = KeyPath::calls();
        let call = base.child("1713");
        assert_eq!(call.to_string(), "calls/1713");
        assert_eq!(call.parent(), Some(base));
        assert_eq!(KeyPath::new(vec![]).parent(), None);
    }

    #[test]
    fn test_starts_with() {
        let deep = KeyPath::parse("users/ada/devices/d1");
        assert!(deep.starts_with(&KeyPath::users()));
        assert!(deep.starts_with(&KeyPath::parse("users/ada/devices")));
        assert!(!deep.starts_with(&KeyPath::parse("users/zoe")));
    }

    #[test]
    fn test_namespace_constructors() {
        let alias = Alias::from("ada");
        assert_eq!(
            KeyPath::contact_requests(&alias).to_string(),
            "users/ada/contactRequests"
        );
        let call = CallId("1713".to_string());
        assert_eq!(KeyPath::call_ice(&call).to_string(), "calls/1713/iceCandidates");
    }
}
