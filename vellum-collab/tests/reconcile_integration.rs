//! Reconciliation against real stores, including partial failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::time::{sleep, Duration};
use uuid::Uuid;
use vellum_collab::reconcile::{ReconcileConfig, Reconciler};
use vellum_collab::storage::{
    MemoryObjectStore, ObjectStore, PersistenceError, RocksObjectStore, StoreConfig,
    UpsertOutcome,
};
use vellum_core::{CanvasObject, DesignScope, LocalObject, ObjectId};

fn object(id: ObjectId, data: &str) -> LocalObject {
    LocalObject::new(id, data, "{}")
}

fn sorted(mut ids: Vec<ObjectId>) -> Vec<ObjectId> {
    ids.sort_unstable();
    ids
}

/// Memory store whose upserts fail for chosen ids and whose calls are logged.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryObjectStore,
    failing: Mutex<HashSet<ObjectId>>,
    calls: Mutex<Vec<&'static str>>,
    tombstone_delay: Option<Duration>,
}

impl FlakyStore {
    fn fail_on(&self, id: ObjectId) {
        self.failing.lock().unwrap().insert(id);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn fetch_live_ids(&self, scope: DesignScope) -> Result<HashSet<ObjectId>, PersistenceError> {
        self.inner.fetch_live_ids(scope).await
    }

    async fn mark_deleted(
        &self,
        scope: DesignScope,
        ids: &[ObjectId],
        at: u64,
    ) -> Result<usize, PersistenceError> {
        if let Some(delay) = self.tombstone_delay {
            sleep(delay).await;
        }
        let changed = self.inner.mark_deleted(scope, ids, at).await;
        self.calls.lock().unwrap().push("tombstone");
        changed
    }

    async fn upsert(
        &self,
        scope: DesignScope,
        object: &LocalObject,
        at: u64,
    ) -> Result<UpsertOutcome, PersistenceError> {
        self.calls.lock().unwrap().push("upsert");
        if self.failing.lock().unwrap().contains(&object.object_id) {
            return Err(PersistenceError::Database("disk unavailable".into()));
        }
        self.inner.upsert(scope, object, at).await
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError> {
        self.inner.get(id).await
    }

    async fn load_scope(&self, scope: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError> {
        self.inner.load_scope(scope).await
    }

    async fn purge_tombstones(&self, older_than: u64) -> Result<usize, PersistenceError> {
        self.inner.purge_tombstones(older_than).await
    }
}

/// Store whose reads always fail.
struct UnreadableStore;

#[async_trait]
impl ObjectStore for UnreadableStore {
    async fn fetch_live_ids(&self, _: DesignScope) -> Result<HashSet<ObjectId>, PersistenceError> {
        Err(PersistenceError::Database("connection refused".into()))
    }

    async fn mark_deleted(&self, _: DesignScope, _: &[ObjectId], _: u64) -> Result<usize, PersistenceError> {
        panic!("must not be called after a failed read");
    }

    async fn upsert(&self, _: DesignScope, _: &LocalObject, _: u64) -> Result<UpsertOutcome, PersistenceError> {
        panic!("must not be called after a failed read");
    }

    async fn get(&self, _: &ObjectId) -> Result<Option<CanvasObject>, PersistenceError> {
        Ok(None)
    }

    async fn load_scope(&self, _: DesignScope) -> Result<Vec<CanvasObject>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn purge_tombstones(&self, _: u64) -> Result<usize, PersistenceError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_two_phase_scenario() {
    let store = Arc::new(MemoryObjectStore::new());
    let reconciler = Reconciler::with_config(store.clone(), ReconcileConfig::for_testing());
    let (user, design) = (Uuid::new_v4(), Uuid::new_v4());
    let scope = DesignScope::new(user, design);
    let (o1, o2, o3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    // Persisted P = {o2, o3}
    reconciler
        .sync_at(user, design, vec![object(o2, "v1"), object(o3, "v1")], 100)
        .await
        .unwrap();

    // Local L = {o1, o2}
    let report = reconciler
        .sync_at(user, design, vec![object(o1, "v1"), object(o2, "v2")], 200)
        .await
        .unwrap();

    assert_eq!(report.tombstoned, vec![o3]);
    assert_eq!(report.created, vec![o1]);
    assert_eq!(report.updated, vec![o2]);
    assert!(report.is_complete());

    let live = store.fetch_live_ids(scope).await.unwrap();
    assert_eq!(live, HashSet::from([o1, o2]));

    let o3_row = store.get(&o3).await.unwrap().unwrap();
    assert!(o3_row.is_deleted);
    assert_eq!(o3_row.updated_at, 200);

    let o2_row = store.get(&o2).await.unwrap().unwrap();
    assert_eq!(o2_row.shape_data, "v2");
    assert_eq!(o2_row.created_at, 100);
}

#[tokio::test]
async fn test_readded_object_is_revived() {
    let store = Arc::new(MemoryObjectStore::new());
    let reconciler = Reconciler::new(store.clone());
    let (user, design) = (Uuid::new_v4(), Uuid::new_v4());
    let id = Uuid::new_v4();

    reconciler.sync_at(user, design, vec![object(id, "a")], 1).await.unwrap();
    reconciler.sync_at(user, design, Vec::new(), 2).await.unwrap();
    assert!(store.get(&id).await.unwrap().unwrap().is_deleted);

    let report = reconciler.sync_at(user, design, vec![object(id, "b")], 3).await.unwrap();
    assert_eq!(report.updated, vec![id]);
    let row = store.get(&id).await.unwrap().unwrap();
    assert!(!row.is_deleted);
    assert_eq!(row.shape_data, "b");
}

#[tokio::test]
async fn test_partial_failure_is_reported_not_fatal() {
    let store = Arc::new(FlakyStore::default());
    let reconciler = Reconciler::with_config(store.clone(), ReconcileConfig::for_testing());
    let (user, design) = (Uuid::new_v4(), Uuid::new_v4());
    let ids: Vec<_> = (0..10).map(|_| Uuid::new_v4()).collect();
    let broken = ids[3];
    store.fail_on(broken);

    let report = reconciler
        .sync_at(user, design, ids.iter().map(|id| object(*id, "x")).collect(), 1)
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken);
    assert!(matches!(report.failed[0].1, PersistenceError::Database(_)));
    assert_eq!(report.created.len(), 9);
    assert!(!report.created.contains(&broken));

    let live = store.fetch_live_ids(DesignScope::new(user, design)).await.unwrap();
    assert_eq!(live.len(), 9);
}

#[tokio::test]
async fn test_tombstones_complete_before_upserts() {
    let store = Arc::new(FlakyStore {
        tombstone_delay: Some(Duration::from_millis(50)),
        ..FlakyStore::default()
    });
    let reconciler = Reconciler::with_config(store.clone(), ReconcileConfig::for_testing());
    let (user, design) = (Uuid::new_v4(), Uuid::new_v4());
    let stale: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
    reconciler
        .sync_at(user, design, stale.iter().map(|id| object(*id, "old")).collect(), 1)
        .await
        .unwrap();
    store.calls.lock().unwrap().clear();

    let fresh: Vec<_> = (0..8).map(|_| object(Uuid::new_v4(), "new")).collect();
    let report = reconciler.sync_at(user, design, fresh, 2).await.unwrap();
    assert_eq!(report.tombstoned, sorted(stale));

    let calls = store.calls();
    assert_eq!(calls.first(), Some(&"tombstone"));
    assert_eq!(calls.iter().filter(|c| **c == "upsert").count(), 8);
    assert_eq!(calls.iter().filter(|c| **c == "tombstone").count(), 1);
}

#[tokio::test]
async fn test_read_failure_aborts_sync() {
    let reconciler = Reconciler::new(Arc::new(UnreadableStore));
    let result = reconciler
        .sync(Uuid::new_v4(), Uuid::new_v4(), vec![object(Uuid::new_v4(), "x")])
        .await;
    assert!(matches!(result, Err(PersistenceError::Database(_))));
}

#[tokio::test]
async fn test_rocks_store_reconciliation() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksObjectStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let reconciler = Reconciler::with_config(store.clone(), ReconcileConfig::for_testing());
    let (user, design) = (Uuid::new_v4(), Uuid::new_v4());
    let scope = DesignScope::new(user, design);

    let first: Vec<_> = (0..20).map(|_| Uuid::new_v4()).collect();
    let report = reconciler
        .sync_at(user, design, first.iter().map(|id| object(*id, "{}")).collect(), 10)
        .await
        .unwrap();
    assert_eq!(report.created.len(), 20);

    // Keep the first half, add five new objects
    let mut second: Vec<_> = first[..10].to_vec();
    second.extend((0..5).map(|_| Uuid::new_v4()));
    let report = reconciler
        .sync_at(user, design, second.iter().map(|id| object(*id, "{}")).collect(), 20)
        .await
        .unwrap();

    assert_eq!(report.tombstoned, sorted(first[10..].to_vec()));
    assert_eq!(report.updated.len(), 10);
    assert_eq!(report.created.len(), 5);

    let live = store.fetch_live_ids(scope).await.unwrap();
    assert_eq!(live, second.iter().copied().collect::<HashSet<_>>());
    assert_eq!(store.load_scope(scope).await.unwrap().len(), 25);
}
