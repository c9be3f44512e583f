//! Client-snapshot reconciliation.
//!
//! A client pushes the full set of objects it holds for a design. The
//! reconciler brings the store in line with that snapshot:
//!
//! ```text
//!   local L           persisted live P
//!      │                    │
//!      └──────► SyncPlan ◄──┘
//!                 │
//!   phase 1       ▼  tombstone P \ L        (one bulk call, completes first)
//!   phase 2       ▼  upsert every l ∈ L     (concurrent, bounded)
//!                 │
//!             SyncReport { created, updated, tombstoned, failed }
//! ```
//!
//! A failing upsert is logged and recorded; it never aborts the sync.
//! Only the initial read of persisted ids is fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use vellum_core::{now_millis, DesignId, DesignScope, LocalObject, ObjectId, UserId};

use crate::storage::{ObjectStore, PersistenceError, UpsertOutcome};

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upserts allowed in flight at once (default: 32)
    pub max_concurrent_upserts: usize,
    /// How long tombstones are kept before `purge_expired_tombstones`
    /// may remove them. `None` keeps them forever (default).
    pub tombstone_retention: Option<Duration>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_concurrent_upserts: 32,
            tombstone_retention: None,
        }
    }
}

impl ReconcileConfig {
    pub fn for_testing() -> Self {
        Self {
            max_concurrent_upserts: 4,
            tombstone_retention: None,
        }
    }
}

/// Which ids a sync touches, in ascending id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_tombstone: Vec<ObjectId>,
    pub to_upsert: Vec<ObjectId>,
}

impl SyncPlan {
    pub fn compute<I>(local: I, persisted: &HashSet<ObjectId>) -> Self
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let local: HashSet<ObjectId> = local.into_iter().collect();
        let mut to_tombstone: Vec<_> = persisted.difference(&local).copied().collect();
        let mut to_upsert: Vec<_> = local.into_iter().collect();
        to_tombstone.sort_unstable();
        to_upsert.sort_unstable();
        Self {
            to_tombstone,
            to_upsert,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_tombstone.is_empty() && self.to_upsert.is_empty()
    }
}

/// Outcome of one sync. Id lists are sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub created: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub tombstoned: Vec<ObjectId>,
    pub failed: Vec<(ObjectId, PersistenceError)>,
    /// Timestamp written to every touched row.
    pub synced_at: u64,
}

impl SyncReport {
    /// No object failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.created.len() + self.updated.len() + self.tombstoned.len()
    }

    fn finish(mut self) -> Self {
        self.created.sort_unstable();
        self.updated.sort_unstable();
        self.tombstoned.sort_unstable();
        self.failed.sort_unstable_by_key(|(id, _)| *id);
        self
    }
}

/// Reconciles client snapshots against an [`ObjectStore`].
pub struct Reconciler<S: ObjectStore> {
    store: Arc<S>,
    config: ReconcileConfig,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ReconcileConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile the design's persisted objects with `local`, stamped now.
    pub async fn sync(
        &self,
        user_id: UserId,
        design_id: DesignId,
        local: Vec<LocalObject>,
    ) -> Result<SyncReport, PersistenceError> {
        self.sync_at(user_id, design_id, local, now_millis()).await
    }

    /// Reconcile with an explicit timestamp.
    ///
    /// Duplicate ids in `local` collapse to the last occurrence.
    pub async fn sync_at(
        &self,
        user_id: UserId,
        design_id: DesignId,
        local: Vec<LocalObject>,
        now: u64,
    ) -> Result<SyncReport, PersistenceError> {
        let scope = DesignScope::new(user_id, design_id);
        let submitted = local.len();
        let mut objects: HashMap<ObjectId, LocalObject> = HashMap::with_capacity(submitted);
        for object in local {
            objects.insert(object.object_id, object);
        }
        if objects.len() < submitted {
            log::debug!(
                "Sync for design {design_id}: {} duplicate ids collapsed",
                submitted - objects.len()
            );
        }

        let persisted = self.store.fetch_live_ids(scope).await?;
        let plan = SyncPlan::compute(objects.keys().copied(), &persisted);
        log::debug!(
            "Sync for design {design_id}: {} to tombstone, {} to upsert",
            plan.to_tombstone.len(),
            plan.to_upsert.len()
        );

        let mut report = SyncReport {
            synced_at: now,
            ..SyncReport::default()
        };

        // Phase 1: tombstones complete before any upsert starts
        if !plan.to_tombstone.is_empty() {
            match self.store.mark_deleted(scope, &plan.to_tombstone, now).await {
                Ok(changed) => {
                    if changed < plan.to_tombstone.len() {
                        log::debug!(
                            "Sync for design {design_id}: {} tombstones already applied",
                            plan.to_tombstone.len() - changed
                        );
                    }
                    report.tombstoned = plan.to_tombstone;
                }
                Err(e) => {
                    log::warn!("Sync for design {design_id}: tombstone phase failed: {e}");
                    report.failed = plan
                        .to_tombstone
                        .into_iter()
                        .map(|id| (id, e.clone()))
                        .collect();
                }
            }
        }

        // Phase 2: concurrent upserts, bounded
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_upserts.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_ids = HashMap::with_capacity(objects.len());
        for (id, object) in objects {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                store.upsert(scope, &object, now).await
            });
            task_ids.insert(handle.id(), id);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task, result)) => {
                    let Some(id) = task_ids.get(&task).copied() else {
                        continue;
                    };
                    match result {
                        Ok(UpsertOutcome::Created) => report.created.push(id),
                        Ok(UpsertOutcome::Updated) => report.updated.push(id),
                        Err(e) => {
                            log::warn!("Sync for design {design_id}: upsert of {id} failed: {e}");
                            report.failed.push((id, e));
                        }
                    }
                }
                Err(join_err) => {
                    let Some(id) = task_ids.get(&join_err.id()).copied() else {
                        continue;
                    };
                    log::error!("Sync for design {design_id}: upsert task for {id} died: {join_err}");
                    report
                        .failed
                        .push((id, PersistenceError::Database(join_err.to_string())));
                }
            }
        }

        let report = report.finish();
        log::info!(
            "Synced design {design_id}: {} created, {} updated, {} tombstoned, {} failed",
            report.created.len(),
            report.updated.len(),
            report.tombstoned.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Remove tombstones older than the configured retention.
    /// Returns 0 without touching the store when retention is unbounded.
    pub async fn purge_expired_tombstones(&self, now: u64) -> Result<usize, PersistenceError> {
        match self.config.tombstone_retention {
            None => Ok(0),
            Some(retention) => {
                let cutoff = now.saturating_sub(retention.as_millis() as u64);
                self.store.purge_tombstones(cutoff).await
            }
        }
    }
}
