use std::borrow::Cow;
use std::collections::HashMap;

/// How keys are compared within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComparer {
    Ordinal,
    IgnoreCase,
}

impl KeyComparer {
    /// The form a key is hashed and compared under.
    pub fn normalize<'k>(self, key: &'k str) -> Cow<'k, str> {
        match self {
            KeyComparer::IgnoreCase if key.chars().any(char::is_uppercase) => {
                Cow::Owned(key.to_lowercase())
            }
            _ => Cow::Borrowed(key),
        }
    }

    /// The part of `key` after `prefix`, if `key` starts with it under this comparer.
    pub fn strip_prefix<'k>(self, key: &'k str, prefix: &str) -> Option<&'k str> {
        match self {
            KeyComparer::Ordinal => key.strip_prefix(prefix),
            KeyComparer::IgnoreCase => {
                let head = key.get(..prefix.len())?;
                (self.normalize(head) == self.normalize(prefix)).then(|| &key[prefix.len()..])
            }
        }
    }
}

/// One stored key and its payload.
///
/// The key keeps the casing it was first inserted with; the value is opaque and may be
/// absent when it was persisted that way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    key: String,
    value: Option<Vec<u8>>,
}

impl Entry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn into_parts(self) -> (String, Option<Vec<u8>>) {
        (self.key, self.value)
    }
}

/// The in-memory key → payload map of a store.
#[derive(Debug, Clone)]
pub struct StoreMap {
    comparer: KeyComparer,
    entries: HashMap<String, Entry>,
}

impl StoreMap {
    pub fn new(comparer: KeyComparer) -> Self {
        Self::with_capacity(comparer, 0)
    }

    pub fn with_capacity(comparer: KeyComparer, capacity: usize) -> Self {
        Self {
            comparer,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn comparer(&self) -> KeyComparer {
        self.comparer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(self.comparer.normalize(key).as_ref())
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(self.comparer.normalize(key).as_ref())
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, key: String, value: Option<Vec<u8>>) -> Option<Option<Vec<u8>>> {
        let normalized = self.comparer.normalize(&key).into_owned();
        match self.entries.get_mut(&normalized) {
            Some(existing) => Some(std::mem::replace(&mut existing.value, value)),
            None => {
                self.entries.insert(normalized, Entry { key, value });
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.remove(self.comparer.normalize(key).as_ref())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(Entry::key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_is_case_sensitive() {
        let mut map = StoreMap::new(KeyComparer::Ordinal);
        map.insert("Key".to_string(), Some(vec![1]));
        assert!(map.contains_key("Key"));
        assert!(!map.contains_key("key"));
    }

    #[test]
    fn test_ignore_case_keeps_first_casing() {
        let mut map = StoreMap::new(KeyComparer::IgnoreCase);
        assert!(map.insert("Key".to_string(), Some(vec![1])).is_none());
        let previous = map.insert("KEY".to_string(), Some(vec![2]));
        assert_eq!(previous, Some(Some(vec![1])));

        assert_eq!(map.len(), 1);
        let entry = map.get("key").unwrap();
        assert_eq!(entry.key(), "Key");
        assert_eq!(entry.value(), Some(&[2u8][..]));
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(KeyComparer::Ordinal.strip_prefix("Person:a", "Person:"), Some("a"));
        assert_eq!(KeyComparer::Ordinal.strip_prefix("person:a", "Person:"), None);
        assert_eq!(KeyComparer::IgnoreCase.strip_prefix("person:a", "Person:"), Some("a"));
        assert_eq!(KeyComparer::IgnoreCase.strip_prefix("P", "Person:"), None);
    }

    #[test]
    fn test_absent_value() {
        let mut map = StoreMap::new(KeyComparer::Ordinal);
        map.insert("k".to_string(), None);
        assert!(map.contains_key("k"));
        assert_eq!(map.get("k").unwrap().value(), None);
        let removed = map.remove("k").unwrap();
        assert_eq!(removed.into_parts(), ("k".to_string(), None));
        assert!(map.is_empty());
    }
}
