//! Key composition strategies.
//!
//! The store treats keys as opaque strings. Subsystems that address records by
//! several identifiers (an account and a device id for sessions, an account
//! and a key id for pre-keys) pick a [`KeyComposer`] for their collection and
//! use it consistently for both writes and lookups.

/// Builds a single store key from ordered parts and splits it back.
pub trait KeyComposer {
    /// Joins `parts` into one key. Must be injective: different non-empty
    /// part lists never produce the same key.
    fn compose(&self, parts: &[&str]) -> String;

    /// Inverse of [`compose`](Self::compose). Returns `None` if `key` was not
    /// produced by this composer.
    fn split(&self, key: &str) -> Option<Vec<String>>;
}

/// Joins parts with a separator character, escaping the separator and the
/// escape character inside parts.
///
/// `DelimitedKey::default()` uses `.` as separator and `\` as escape, so
/// `["+15550100", "2"]` becomes `+15550100.2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedKey {
    separator: char,
    escape: char,
}

impl DelimitedKey {
    /// # Panics
    ///
    /// Panics if `separator` and `escape` are the same character.
    pub fn new(separator: char, escape: char) -> Self {
        assert_ne!(
            separator, escape,
            "separator and escape character must differ"
        );
        Self { separator, escape }
    }

    pub fn separator(&self) -> char {
        self.separator
    }
}

impl Default for DelimitedKey {
    fn default() -> Self {
        Self::new('.', '\\')
    }
}

impl KeyComposer for DelimitedKey {
    fn compose(&self, parts: &[&str]) -> String {
        let mut key = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                key.push(self.separator);
            }
            for ch in part.chars() {
                if ch == self.separator || ch == self.escape {
                    key.push(self.escape);
                }
                key.push(ch);
            }
        }
        key
    }

    fn split(&self, key: &str) -> Option<Vec<String>> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = key.chars();

        while let Some(ch) = chars.next() {
            if ch == self.escape {
                let escaped = chars.next()?;
                if escaped != self.separator && escaped != self.escape {
                    return None;
                }
                current.push(escaped);
            } else if ch == self.separator {
                parts.push(std::mem::take(&mut current));
            } else {
                current.push(ch);
            }
        }
        parts.push(current);

        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_device_key() {
        let keys = DelimitedKey::default();
        let key = keys.compose(&["+15550100", "2"]);
        assert_eq!(key, "+15550100.2");
        assert_eq!(
            keys.split(&key).unwrap(),
            vec!["+15550100".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn test_separator_inside_part_is_escaped() {
        let keys = DelimitedKey::default();
        let a = keys.compose(&["a.b", "c"]);
        let b = keys.compose(&["a", "b.c"]);
        assert_ne!(a, b);
        assert_eq!(keys.split(&a).unwrap(), vec!["a.b", "c"]);
        assert_eq!(keys.split(&b).unwrap(), vec!["a", "b.c"]);
    }

    #[test]
    fn test_escape_inside_part() {
        let keys = DelimitedKey::default();
        let key = keys.compose(&["dir\\name", ""]);
        assert_eq!(keys.split(&key).unwrap(), vec!["dir\\name", ""]);
    }

    #[test]
    fn test_dangling_escape_rejected() {
        let keys = DelimitedKey::default();
        assert!(keys.split("abc\\").is_none());
        assert!(keys.split("a\\bc").is_none());
    }

    #[test]
    fn test_custom_separator() {
        let keys = DelimitedKey::new(':', '%');
        assert_eq!(keys.separator(), ':');
        let key = keys.compose(&["uuid-1", "7"]);
        assert_eq!(key, "uuid-1:7");
    }
}
