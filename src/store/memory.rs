//! In-process `KvStore` backed by hash maps.
//!
//! Suitable for single-process deployments and tests. Compare-and-swap is
//! atomic because every operation takes the same lock.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::KvStore;

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    /// member -> insertion sequence, per set.
    sets: HashMap<String, HashMap<String, u64>>,
    next_seq: u64,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.values.remove(key).is_some())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let Some(set) = inner.sets.get(set_key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &u64)> = set.iter().collect();
        members.sort_by_key(|(_, seq)| **seq);
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        let set = inner.sets.entry(set_key.to_string()).or_default();
        if set.contains_key(member) {
            return Ok(false);
        }
        set.insert(member.to_string(), seq);
        inner.next_seq += 1;
        Ok(true)
    }

    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .sets
            .get_mut(set_key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn set_cardinality(&self, set_key: &str) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sets
            .get(set_key)
            .map(|s| s.len())
            .unwrap_or(0))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        inner.values.insert(key.to_string(), new.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "v1").await.unwrap();
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_membership_is_idempotent_and_ordered() {
        let store = MemoryStore::new();
        assert!(store.add_to_set("s", "b").await.unwrap());
        assert!(store.add_to_set("s", "a").await.unwrap());
        assert!(!store.add_to_set("s", "b").await.unwrap());
        assert!(store.add_to_set("s", "c").await.unwrap());

        assert_eq!(store.set_members("s").await.unwrap(), vec!["b", "a", "c"]);
        assert_eq!(store.set_cardinality("s").await.unwrap(), 3);

        assert!(store.remove_from_set("s", "a").await.unwrap());
        assert!(!store.remove_from_set("s", "a").await.unwrap());
        assert!(!store.remove_from_set("missing", "a").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn compare_and_swap_checks_current_value() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("t", None, "1").await.unwrap());
        assert!(!store.compare_and_swap("t", None, "2").await.unwrap());
        assert!(!store.compare_and_swap("t", Some("0"), "2").await.unwrap());
        assert!(store.compare_and_swap("t", Some("1"), "2").await.unwrap());
        assert_eq!(store.get("t").await.unwrap().as_deref(), Some("2"));
    }
}
