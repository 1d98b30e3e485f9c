//! Interface to the embedded document store.
//!
//! The real store lives outside this crate; everything here talks to it
//! through the [`Kv`] trait. [`MemKv`] is the in-memory implementation
//! used by tests and simple embeddings.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Document collections used by the control plane.
pub mod collections {
    /// Room history documents, keyed by room uuid.
    pub const ROOMS: &str = "rooms";
    /// Join rows, keyed by `<user_id>:<room_cid>`.
    pub const JOINS: &str = "joins";
    /// Single-use WebSocket tickets, keyed by ticket.
    pub const TICKETS: &str = "tickets";
    /// Authenticated sessions.
    pub const SESSIONS: &str = "sessions";
    /// User profiles, keyed by user name.
    pub const USERS: &str = "users";
    /// Persistent deferred jobs.
    pub const TASKS: &str = "tasks";
    /// Time-stamped `{t, g, l}` telemetry triples.
    pub const GAUGES: &str = "gauges";
    /// Whiteboard links, keyed by room cid.
    pub const WHITEBOARDS: &str = "whiteboards";
}

/// Error of a document store operation.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("document store failure: {0}")]
    Backend(String),
}

/// Minimal document-store surface: named collections of JSON documents
/// with string keys.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, KvError>;

    async fn put(&self, collection: &str, key: &str, document: Value) -> Result<(), KvError>;

    /// JSON merge-patch of an existing document; a no-op when the document
    /// does not exist.
    async fn patch(&self, collection: &str, key: &str, patch: Value) -> Result<(), KvError>;

    async fn del(&self, collection: &str, key: &str) -> Result<(), KvError>;

    async fn list(&self, collection: &str) -> Result<Vec<Value>, KvError>;

    async fn count(&self, collection: &str) -> Result<usize, KvError>;
}

/// In-memory document store.
#[derive(Default)]
pub struct MemKv {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => {
            *target = patch.clone();
        }
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|documents| documents.get(key))
            .cloned())
    }

    async fn put(&self, collection: &str, key: &str, document: Value) -> Result<(), KvError> {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document);
        Ok(())
    }

    async fn patch(&self, collection: &str, key: &str, patch: Value) -> Result<(), KvError> {
        let mut collections = self.collections.lock();
        if let Some(document) = collections
            .get_mut(collection)
            .and_then(|documents| documents.get_mut(key))
        {
            merge_patch(document, &patch);
        }
        Ok(())
    }

    async fn del(&self, collection: &str, key: &str) -> Result<(), KvError> {
        if let Some(documents) = self.collections.lock().get_mut(collection) {
            documents.remove(key);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, KvError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<usize, KvError> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|documents| documents.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;
    use serde_json::json;

    #[test]
    fn put_get_del_round_trip() {
        future::block_on(async {
            let kv = MemKv::new();
            kv.put(collections::ROOMS, "a", json!({"uuid": "a"}))
                .await
                .unwrap();
            assert_eq!(
                kv.get(collections::ROOMS, "a").await.unwrap(),
                Some(json!({"uuid": "a"})),
            );
            assert_eq!(kv.count(collections::ROOMS).await.unwrap(), 1);
            kv.del(collections::ROOMS, "a").await.unwrap();
            assert_eq!(kv.get(collections::ROOMS, "a").await.unwrap(), None);
        });
    }

    #[test]
    fn patch_merges_objects_and_removes_nulls() {
        future::block_on(async {
            let kv = MemKv::new();
            kv.put("c", "k", json!({"a": 1, "b": {"x": 1}})).await.unwrap();
            kv.patch("c", "k", json!({"a": null, "b": {"y": 2}}))
                .await
                .unwrap();
            assert_eq!(
                kv.get("c", "k").await.unwrap(),
                Some(json!({"b": {"x": 1, "y": 2}})),
            );
        });
    }
}
