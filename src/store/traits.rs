//! `KvStore` trait: the narrow key/value + set interface the campaign runs on.
//!
//! No multi-key transactions are assumed. Callers that touch several keys
//! order their writes so a crash in between is recoverable.

use async_trait::async_trait;

use crate::error::StoreError;

/// Backend-agnostic key/value store with per-key sets.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All members of a set, oldest first.
    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError>;

    /// Add a member. Returns `false` if it was already present.
    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member. Returns `false` if it was absent.
    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of members in a set.
    async fn set_cardinality(&self, set_key: &str) -> Result<usize, StoreError>;

    /// Write `new` only if the current value equals `expected` (`None` = key absent).
    /// Returns whether the write happened.
    ///
    /// The default is a plain read-then-write and is not atomic; backends
    /// with a conditional write primitive override it.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let current = self.get(key).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.set(key, new).await?;
        Ok(true)
    }
}
