use serde::{Deserialize, Serialize};

// User identity = self-chosen alias string. No email, no phone number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Alias(pub String);

impl Alias {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Alias {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Call identifier: wall-clock milliseconds at initiation, as a string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Mint a fresh time-based call id.
    pub fn new() -> Self {
        Self(now_millis().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direct chat thread id: the two participant aliases sorted and joined
/// with an underscore, so both parties derive the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn between(a: &Alias, b: &Alias) -> Self {
        let mut pair = [a.as_str(), b.as_str()];
        pair.sort();
        Self(format!("{}_{}", pair[0], pair[1]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participant aliases, in sorted order.
    pub fn participants(&self) -> Option<(Alias, Alias)> {
        let (a, b) = self.0.split_once('_')?;
        Some((Alias::from(a), Alias::from(b)))
    }

    /// Given one participant, the other one. `None` when the sender is not
    /// part of this thread (a malformed record).
    pub fn other_party(&self, sender: &Alias) -> Option<Alias> {
        let (a, b) = self.participants()?;
        if &a == sender {
            Some(b)
        } else if &b == sender {
            Some(a)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time as Unix milliseconds, the timestamp unit every
/// record in the graph uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
