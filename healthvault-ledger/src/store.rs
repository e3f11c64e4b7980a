//! Document-store seam.
//!
//! The core needs single-document atomic updates with an optimistic version
//! check, server-side timestamps, and simple equality / array-membership
//! queries. Nothing spans documents.

use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A stored document with its concurrency version.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub body: Value,
}

/// Query predicate on a top-level field.
#[derive(Clone, Debug)]
pub enum Filter {
    Eq(String, Value),
    ArrayContains(String, Value),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn array_contains(field: &str, value: impl Into<Value>) -> Self {
        Filter::ArrayContains(field.to_string(), value.into())
    }

    fn matches(&self, body: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => body.get(field) == Some(value),
            Filter::ArrayContains(field, value) => body
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Multi-tenant document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> LedgerResult<Option<Document>>;

    /// Creates a document; `Conflict` if the id is taken.
    async fn create(&self, collection: &str, id: &str, body: Value) -> LedgerResult<Document>;

    /// Replaces a document if its version still equals `expected_version`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> LedgerResult<Document>;

    /// Documents matching every filter, in id order.
    async fn query(&self, collection: &str, filters: &[Filter]) -> LedgerResult<Vec<Document>>;
}

/// In-process document store. Read-your-writes, per-document versioning.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> LedgerResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn create(&self, collection: &str, id: &str, body: Value) -> LedgerResult<Document> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(LedgerError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: 0,
            });
        }
        let doc = Document {
            id: id.to_string(),
            version: 1,
            updated_at: Utc::now(),
            body,
        };
        docs.insert(id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> LedgerResult<Document> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| LedgerError::NotFound(format!("{collection}/{id}")))?;

        if doc.version != expected_version {
            return Err(LedgerError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
            });
        }
        doc.version += 1;
        doc.updated_at = Utc::now();
        doc.body = body;
        Ok(doc.clone())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> LedgerResult<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| filters.iter().all(|f| f.matches(&d.body)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A deserialized document plus the version it was read at.
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Serde-typed access to a [`DocumentStore`].
#[derive(Clone)]
pub struct TypedStore {
    inner: Arc<dyn DocumentStore>,
    max_conflicts: u32,
}

impl TypedStore {
    pub fn new(inner: Arc<dyn DocumentStore>, max_conflicts: u32) -> Self {
        Self {
            inner,
            max_conflicts,
        }
    }

    pub fn raw(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> LedgerResult<Option<Versioned<T>>> {
        match self.inner.get(collection, id).await? {
            Some(doc) => Ok(Some(Versioned {
                version: doc.version,
                value: serde_json::from_value(doc.body)?,
            })),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but `NotFound` when absent.
    pub async fn require<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> LedgerResult<Versioned<T>> {
        self.get(collection, id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("{collection}/{id}")))
    }

    pub async fn create<T: Serialize + Sync>(
        &self,
        collection: &str,
        id: &str,
        value: &T,
    ) -> LedgerResult<u64> {
        let doc = self
            .inner
            .create(collection, id, serde_json::to_value(value)?)
            .await?;
        Ok(doc.version)
    }

    pub async fn update<T: Serialize + Sync>(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        value: &T,
    ) -> LedgerResult<u64> {
        let doc = self
            .inner
            .update(collection, id, expected_version, serde_json::to_value(value)?)
            .await?;
        Ok(doc.version)
    }

    /// Read-modify-write with the optimistic version check.
    ///
    /// On a version conflict the document is re-read and `mutate` applied
    /// again, up to the configured number of attempts. `mutate` must be safe
    /// to run more than once.
    pub async fn modify<T, F>(&self, collection: &str, id: &str, mut mutate: F) -> LedgerResult<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnMut(&mut T) -> LedgerResult<()> + Send,
    {
        let mut attempt = 0;
        loop {
            let Versioned { version, mut value } = self.require::<T>(collection, id).await?;
            mutate(&mut value)?;
            match self.update(collection, id, version, &value).await {
                Ok(_) => return Ok(value),
                Err(LedgerError::Conflict { .. }) if attempt < self.max_conflicts => {
                    attempt += 1;
                    debug!(collection, id, attempt, "write conflict, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> LedgerResult<Vec<Versioned<T>>> {
        self.inner
            .query(collection, filters)
            .await?
            .into_iter()
            .map(|doc| {
                Ok(Versioned {
                    version: doc.version,
                    value: serde_json::from_value(doc.body)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = InMemoryDocumentStore::new();
        store.create("c", "a", json!({"x": 1})).await.unwrap();
        let err = store.create("c", "a", json!({"x": 2})).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { expected: 0, .. }));
    }

    #[tokio::test]
    async fn stale_version_update_conflicts() {
        let store = InMemoryDocumentStore::new();
        let doc = store.create("c", "a", json!({"x": 1})).await.unwrap();
        store.update("c", "a", doc.version, json!({"x": 2})).await.unwrap();
        let err = store
            .update("c", "a", doc.version, json!({"x": 3}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { expected: 1, .. }));
        let current = store.get("c", "a").await.unwrap().unwrap();
        assert_eq!(current.body, json!({"x": 2}));
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn query_by_equality_and_membership() {
        let store = InMemoryDocumentStore::new();
        store
            .create("c", "a", json!({"owner": "u1", "readers": ["u2", "u3"]}))
            .await
            .unwrap();
        store
            .create("c", "b", json!({"owner": "u2", "readers": ["u1"]}))
            .await
            .unwrap();

        let owned = store.query("c", &[Filter::eq("owner", "u1")]).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, "a");

        let readable = store
            .query("c", &[Filter::array_contains("readers", "u1")])
            .await
            .unwrap();
        assert_eq!(readable.len(), 1);
        assert_eq!(readable[0].id, "b");
    }

    #[tokio::test]
    async fn modify_retries_after_conflict() {
        let raw = Arc::new(InMemoryDocumentStore::new());
        raw.create("c", "a", json!({"n": 0})).await.unwrap();
        let typed = TypedStore::new(raw.clone(), 3);

        let mut first = true;
        let result: Value = typed
            .modify("c", "a", |v: &mut Value| {
                if first {
                    first = false;
                    // Simulate another writer landing between read and write.
                    let raw = raw.clone();
                    std::thread::spawn(move || {
                        tokio::runtime::Builder::new_current_thread()
                            .build()
                            .unwrap()
                            .block_on(raw.update("c", "a", 1, json!({"n": 10})))
                            .unwrap();
                    })
                    .join()
                    .unwrap();
                }
                let n = v["n"].as_i64().unwrap_or_default();
                v["n"] = json!(n + 1);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result, json!({"n": 11}));
    }
}
