//! Per-process origin tag.
//!
//! Every record a process publishes is stamped with `<prefix>#<uid>`. The uid
//! is drawn once at startup and shared by every adapter in the process.

use std::fmt;

use rand::distr::Alphanumeric;
use rand::Rng;

/// Length of the random part of an origin tag.
pub const UID_LEN: usize = 6;

/// Default key prefix for origin tags.
pub const DEFAULT_KEY_PREFIX: &str = "socket.io";

/// Identifier of the process that wrote a relay record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginId {
    prefix: String,
    uid: String,
}

impl OriginId {
    /// Draw a fresh origin id.
    pub fn generate(prefix: impl Into<String>) -> Self {
        let uid: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(UID_LEN)
            .map(char::from)
            .collect();
        Self::from_parts(prefix, uid)
    }

    pub fn from_parts(prefix: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            uid: uid.into(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The tag written into the `origin_id` column.
    pub fn key(&self) -> String {
        format!("{}#{}", self.prefix, self.uid)
    }

    /// Whether a stored tag was written by this process.
    ///
    /// Only the segment after the last `#` is compared, so the prefix a peer
    /// was configured with does not matter.
    pub fn owns(&self, stored: &str) -> bool {
        stored.rsplit('#').next() == Some(self.uid.as_str())
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.prefix, self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_uses_prefix_and_uid_len() {
        let origin = OriginId::generate("socket.io");
        assert_eq!(origin.prefix(), "socket.io");
        assert_eq!(origin.uid().len(), UID_LEN);
        assert!(origin.uid().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(origin.key(), format!("socket.io#{}", origin.uid()));
    }

    #[test]
    fn test_generate_is_unlikely_to_collide() {
        let ids: HashSet<String> = (0..1000)
            .map(|_| OriginId::generate("p").uid().to_string())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_owns_compares_last_segment() {
        let origin = OriginId::from_parts("socket.io", "abc123");
        assert!(origin.owns("socket.io#abc123"));
        assert!(origin.owns("other.prefix#abc123"));
        assert!(origin.owns("abc123"));
        assert!(!origin.owns("socket.io#zzz999"));
        assert!(!origin.owns("socket.io#abc123#x"));
        assert!(!origin.owns(""));
    }

    #[test]
    fn test_display_matches_key() {
        let origin = OriginId::from_parts("relay", "q1w2e3");
        assert_eq!(origin.to_string(), origin.key());
    }
}
