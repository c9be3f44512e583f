//! Process-local object store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use vellum_core::{CanvasObject, DesignScope, LocalObject, ObjectId};

use super::{ObjectStore, PersistenceError, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectId, CanvasObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Seed a row directly, bypassing upsert semantics.
    pub async fn insert(&self, object: CanvasObject) {
        self.objects.write().await.insert(object.object_id, object);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch_live_ids(&self, scope: DesignScope) -> Result<HashSet<ObjectId>, PersistenceError> {
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.is_live() && o.scope() == scope)
            .map(|o| o.object_id)
            .collect())
    }

    async fn mark_deleted(
        &self,
        scope: DesignScope,
        ids: &[ObjectId],
        at: u64,
    ) -> Result<usize, PersistenceError> {
        let mut objects = self.objects.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(object) = objects.get_mut(id) {
                if object.scope() == scope && object.is_live() {
                    object.tombstone(at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn upsert(
        &self,
        scope: DesignScope,
        object: &LocalObject,
        at: u64,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut objects = self.objects.write().await;
        match objects.get_mut(&object.object_id) {
            Some(existing) if existing.scope() != scope => Err(PersistenceError::Rejected(format!(
                "object {} belongs to another design",
                object.object_id
            ))),
            Some(existing) => {
                existing.overwrite(object, at);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                objects.insert(object.object_id, CanvasObject::create(scope, object, at));
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError> {
        Ok(self.objects.read().await.get(id).cloned())
    }

    async fn load_scope(&self, scope: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError> {
        let mut rows: Vec<_> = self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.scope() == scope)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.object_id);
        Ok(rows)
    }

    async fn purge_tombstones(&self, older_than: u64) -> Result<usize, PersistenceError> {
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|_, o| o.is_live() || o.updated_at >= older_than);
        Ok(before - objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scope() -> DesignScope {
        DesignScope::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_upsert_create_then_update() {
        let store = MemoryObjectStore::new();
        let s = scope();
        let local = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        assert_eq!(store.upsert(s, &local, 1).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert(s, &local, 2).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.get(&local.object_id).await.unwrap().unwrap().updated_at, 2);
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_row() {
        let store = MemoryObjectStore::new();
        let s = scope();
        let local = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        store.upsert(s, &local, 1).await.unwrap();

        assert_eq!(store.mark_deleted(s, &[local.object_id], 5).await.unwrap(), 1);
        assert_eq!(store.mark_deleted(s, &[local.object_id], 6).await.unwrap(), 0);
        assert!(store.fetch_live_ids(s).await.unwrap().is_empty());
        let row = store.get(&local.object_id).await.unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.updated_at, 5);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = MemoryObjectStore::new();
        let (a, b) = (scope(), scope());
        let local = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        store.upsert(a, &local, 1).await.unwrap();

        assert!(store.fetch_live_ids(b).await.unwrap().is_empty());
        assert_eq!(store.mark_deleted(b, &[local.object_id], 2).await.unwrap(), 0);
        assert!(matches!(
            store.upsert(b, &local, 3).await,
            Err(PersistenceError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_only_old_tombstones() {
        let store = MemoryObjectStore::new();
        let s = scope();
        let old = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        let recent = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        let live = LocalObject::new(Uuid::new_v4(), "{}", "{}");
        for o in [&old, &recent, &live] {
            store.upsert(s, o, 1).await.unwrap();
        }
        store.mark_deleted(s, &[old.object_id], 10).await.unwrap();
        store.mark_deleted(s, &[recent.object_id], 100).await.unwrap();

        assert_eq!(store.purge_tombstones(50).await.unwrap(), 1);
        assert!(store.get(&old.object_id).await.unwrap().is_none());
        assert!(store.get(&recent.object_id).await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
    }
}
