//! Typed logical tables inside one store.
//!
//! A filter maps every key it is given to `"<TypeName>:" + key` and forwards to the
//! [`Database`]. The data lives in the database; filters hold no state besides the prefix
//! and an optional per-value encryption key, so they are cheap to create on demand.
//!
//! [`TypeFilter`] encodes values with bincode through serde, like the database's own
//! typed methods. [`CustomFilter`] defers to the type's [`ValueSerializer`] impl.

use std::marker::PhantomData;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::Database;
use crate::{Result, ValueSerializer};

/// Short name of `T`: its last path segment, without generic arguments.
pub fn type_tag<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// The key prefix filters of `T` use.
pub fn type_prefix<T: ?Sized>() -> String {
    format!("{}:", type_tag::<T>())
}

/// The untyped half shared by both filter flavors.
#[derive(Debug, Clone)]
struct Namespace<'db> {
    db: &'db Database,
    prefix: String,
    value_key: Option<String>,
}

impl<'db> Namespace<'db> {
    fn new<T: ?Sized>(db: &'db Database) -> Self {
        Self {
            db,
            prefix: type_prefix::<T>(),
            value_key: None,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn value_key(&self) -> Option<&str> {
        self.value_key.as_deref()
    }

    fn contains_key(&self, key: &str) -> bool {
        self.db.contains_key(&self.key(key))
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.db.try_get(&self.key(key), self.value_key())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        self.db.upsert(&self.key(key), bytes, self.value_key())?;
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.db.remove(&self.key(key))
    }

    fn remove_where<P: FnMut(&str) -> bool>(&self, predicate: P) -> Result<usize> {
        self.db.remove_where(predicate, Some(&self.prefix))
    }

    fn keys(&self) -> Vec<String> {
        let comparer = self.db.comparer();
        self.db
            .keys()
            .iter()
            .filter_map(|key| comparer.strip_prefix(key, &self.prefix).map(str::to_owned))
            .collect()
    }
}

fn decoded<T>(key: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Filtered value for key '{}' could not be decoded: {}", key, e);
            None
        }
    }
}

/// A table of serde values stored under `"<TypeName>:"` keys.
///
/// ```no_run
/// # use quiver_store::engine::Database;
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct Person { name: String }
/// let db = Database::in_memory();
/// let people = db.filter::<Person>();
/// people.upsert("ada", &Person { name: "Ada".into() })?;
/// assert!(people.contains_key("ada"));
/// assert!(!db.contains_key("ada"));
/// # Ok::<(), quiver_store::Error>(())
/// ```
pub struct TypeFilter<'db, T> {
    ns: Namespace<'db>,
    _marker: PhantomData<fn() -> T>,
}

impl<'db, T> TypeFilter<'db, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(db: &'db Database) -> Self {
        Self {
            ns: Namespace::new::<T>(db),
            _marker: PhantomData,
        }
    }

    /// Encrypts every value of this table with `value_key`.
    pub fn with_value_key(mut self, value_key: impl Into<String>) -> Self {
        self.ns.value_key = Some(value_key.into()).filter(|k| !k.is_empty());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.ns.prefix
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.ns.contains_key(key)
    }

    pub fn try_get(&self, key: &str) -> Option<T> {
        let bytes = self.ns.get(key)?;
        decoded(key, bincode::deserialize(&bytes).map_err(Into::into))
    }

    pub fn try_get_many(&self, key: &str) -> Option<Vec<T>> {
        let bytes = self.ns.get(key)?;
        decoded(key, bincode::deserialize(&bytes).map_err(Into::into))
    }

    pub fn upsert(&self, key: &str, value: &T) -> Result<bool> {
        self.ns.put(key, &bincode::serialize(value)?)
    }

    /// Writes `value` unless a current value exists and `condition` rejects it.
    pub fn upsert_if<F>(&self, key: &str, value: &T, condition: F) -> Result<bool>
    where
        F: FnOnce(&T) -> bool,
    {
        self.ns
            .db
            .upsert_as_if(&self.ns.key(key), value, self.ns.value_key(), condition)
    }

    pub fn upsert_many(&self, key: &str, values: &[T]) -> Result<bool> {
        self.ns.put(key, &bincode::serialize(values)?)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.ns.remove(key)
    }

    /// Removes every entry of this table whose unprefixed key satisfies `predicate`.
    pub fn remove_where<P: FnMut(&str) -> bool>(&self, predicate: P) -> Result<usize> {
        self.ns.remove_where(predicate)
    }

    /// Keys of this table, without the prefix.
    pub fn keys(&self) -> Vec<String> {
        self.ns.keys()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A table of values that bring their own [`ValueSerializer`].
pub struct CustomFilter<'db, T> {
    ns: Namespace<'db>,
    _marker: PhantomData<fn() -> T>,
}

impl<'db, T: ValueSerializer> CustomFilter<'db, T> {
    pub fn new(db: &'db Database) -> Self {
        Self {
            ns: Namespace::new::<T>(db),
            _marker: PhantomData,
        }
    }

    pub fn with_value_key(mut self, value_key: impl Into<String>) -> Self {
        self.ns.value_key = Some(value_key.into()).filter(|k| !k.is_empty());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.ns.prefix
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.ns.contains_key(key)
    }

    pub fn try_get(&self, key: &str) -> Option<T> {
        let bytes = self.ns.get(key)?;
        decoded(key, T::deserialize(&bytes))
    }

    pub fn try_get_many(&self, key: &str) -> Option<Vec<T>> {
        let bytes = self.ns.get(key)?;
        decoded(key, T::deserialize_many(&bytes))
    }

    pub fn upsert(&self, key: &str, value: &T) -> Result<bool> {
        self.ns.put(key, &T::serialize(value)?)
    }

    pub fn upsert_if<F>(&self, key: &str, value: &T, condition: F) -> Result<bool>
    where
        F: FnOnce(&T) -> bool,
    {
        if let Some(existing) = self.try_get(key) {
            if !condition(&existing) {
                return Ok(false);
            }
        }
        self.upsert(key, value)
    }

    pub fn upsert_many(&self, key: &str, values: &[T]) -> Result<bool> {
        self.ns.put(key, &T::serialize_many(values)?)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.ns.remove(key)
    }

    pub fn remove_where<P: FnMut(&str) -> bool>(&self, predicate: P) -> Result<usize> {
        self.ns.remove_where(predicate)
    }

    pub fn keys(&self) -> Vec<String> {
        self.ns.keys()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseConfig, Error};
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Person {
        name: String,
        age: u8,
    }

    #[derive(Debug, PartialEq)]
    struct Tag(String);

    impl ValueSerializer for Tag {
        fn serialize(value: &Self) -> Result<Vec<u8>> {
            Ok(value.0.as_bytes().to_vec())
        }

        fn deserialize(bytes: &[u8]) -> Result<Self> {
            String::from_utf8(bytes.to_vec())
                .map(Tag)
                .map_err(|e| Error::InvalidArgument(e.to_string()))
        }

        fn serialize_many(values: &[Self]) -> Result<Vec<u8>> {
            let joined: Vec<&str> = values.iter().map(|t| t.0.as_str()).collect();
            Ok(joined.join(",").into_bytes())
        }

        fn deserialize_many(bytes: &[u8]) -> Result<Vec<Self>> {
            let text = std::str::from_utf8(bytes).map_err(|e| Error::InvalidArgument(e.to_string()))?;
            Ok(text.split(',').map(|s| Tag(s.to_string())).collect())
        }
    }

    fn ada() -> Person {
        Person { name: "Ada".to_string(), age: 36 }
    }

    #[test]
    fn test_type_tag() {
        assert_eq!(type_tag::<Person>(), "Person");
        assert_eq!(type_tag::<Vec<u8>>(), "Vec");
        assert_eq!(type_prefix::<u32>(), "u32:");
    }

    #[test]
    fn test_filter_isolation() {
        let db = Database::in_memory();
        let people = db.filter::<Person>();
        people.upsert("a", &ada()).unwrap();

        assert!(people.contains_key("a"));
        assert!(!db.contains_key("a"));
        assert!(db.contains_key("Person:a"));
        assert_eq!(people.try_get("a").unwrap(), ada());
        assert!(db.filter::<Tag2>().try_get("a").is_none());
    }

    #[derive(Serialize, Deserialize)]
    struct Tag2(String);

    #[test]
    fn test_filter_keys_and_remove_where() {
        let db = Database::in_memory();
        db.upsert("loose", b"x", None).unwrap();
        let people = db.filter::<Person>();
        for name in ["ann", "bob", "amy"] {
            people.upsert(name, &ada()).unwrap();
        }
        let mut keys = people.keys();
        keys.sort();
        assert_eq!(keys, vec!["amy", "ann", "bob"]);

        assert_eq!(people.remove_where(|k| k.starts_with('a')).unwrap(), 2);
        assert_eq!(people.len(), 1);
        assert!(db.contains_key("loose"));
        assert!(people.remove("bob").unwrap());
        assert!(people.is_empty());
    }

    #[test]
    fn test_filter_many_and_condition() {
        let db = Database::in_memory();
        let people = db.filter::<Person>().with_value_key("pk");
        people.upsert_many("group", &[ada(), ada()]).unwrap();
        assert_eq!(people.try_get_many("group").unwrap().len(), 2);

        people.upsert("p", &ada()).unwrap();
        let older = Person { age: 20, ..ada() };
        assert!(!people.upsert_if("p", &older, |cur| cur.age < 30).unwrap());
        assert!(people.upsert_if("p", &older, |cur| cur.age > 30).unwrap());
        assert_eq!(people.try_get("p").unwrap().age, 20);

        // Stored encrypted under the filter's value key.
        assert!(db.try_get_as::<Person>("Person:p", None).is_none());
    }

    #[test]
    fn test_ignore_case_filter() {
        let db = Database::create_or_load(DatabaseConfig::in_memory().with_ignore_case(true)).unwrap();
        let people = db.filter::<Person>();
        people.upsert("Ada", &ada()).unwrap();
        assert!(people.contains_key("ADA"));
        assert!(db.contains_key("person:ada"));
        assert_eq!(people.keys(), vec!["Ada"]);
    }

    #[test]
    fn test_custom_filter() {
        let db = Database::in_memory();
        let tags = db.custom_filter::<Tag>();
        tags.upsert("t", &Tag("rust".to_string())).unwrap();
        assert_eq!(db.try_get("Tag:t", None).unwrap(), b"rust");
        assert_eq!(tags.try_get("t").unwrap(), Tag("rust".to_string()));

        tags.upsert_many("all", &[Tag("a".to_string()), Tag("b".to_string())]).unwrap();
        assert_eq!(tags.try_get_many("all").unwrap().len(), 2);

        db.upsert("Tag:bad", &[0xff, 0xfe], None).unwrap();
        assert!(tags.try_get("bad").is_none());
    }
}
