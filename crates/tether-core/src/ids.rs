//! Branded session identifier.
//!
//! Session IDs are UUID v7 strings (time-ordered) unless the caller supplies
//! one for reconnection continuity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Process-unique identifier for a channel session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random ID (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for SessionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<SessionId> = (0..100).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn new_id_is_uuid() {
        let id = SessionId::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from("sess_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_1\"");
        let back: SessionId = serde_json::from_str("\"sess_1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(SessionId::from("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
    }
}
