//! Durable canvas objects.
//!
//! A `CanvasObject` is one row of the persisted design: its id is assigned
//! once and never reused, and deletion is a tombstone flag rather than a
//! physical removal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ObjectId = Uuid;
pub type DesignId = Uuid;
pub type UserId = Uuid;

/// The (owner, design) pair every persisted object is scoped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DesignScope {
    pub user_id: UserId,
    pub design_id: DesignId,
}

impl DesignScope {
    pub fn new(user_id: UserId, design_id: DesignId) -> Self {
        Self { user_id, design_id }
    }
}

/// One object of a participant's local snapshot, as submitted for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalObject {
    pub object_id: ObjectId,
    /// Serialized shape description (JSON text).
    pub shape_data: String,
    /// Serialized auxiliary attributes (JSON text).
    pub shape_custom_properties: String,
    /// Spatial-partition tag, if the client assigned one.
    pub node_id: Option<String>,
}

impl LocalObject {
    pub fn new(
        object_id: ObjectId,
        shape_data: impl Into<String>,
        shape_custom_properties: impl Into<String>,
    ) -> Self {
        Self {
            object_id,
            shape_data: shape_data.into(),
            shape_custom_properties: shape_custom_properties.into(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Persisted canvas object row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub object_id: ObjectId,
    pub design_id: DesignId,
    pub user_id: UserId,
    pub shape_data: String,
    pub shape_custom_properties: String,
    pub node_id: Option<String>,
    pub is_deleted: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl CanvasObject {
    /// Build a fresh live row from a local object.
    pub fn create(scope: DesignScope, local: &LocalObject, now: u64) -> Self {
        Self {
            object_id: local.object_id,
            design_id: scope.design_id,
            user_id: scope.user_id,
            shape_data: local.shape_data.clone(),
            shape_custom_properties: local.shape_custom_properties.clone(),
            node_id: local.node_id.clone(),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the mutable columns from a local object and revive the row.
    ///
    /// `object_id`, the scope and `created_at` are never touched.
    pub fn overwrite(&mut self, local: &LocalObject, now: u64) {
        self.shape_data.clone_from(&local.shape_data);
        self.shape_custom_properties
            .clone_from(&local.shape_custom_properties);
        self.node_id.clone_from(&local.node_id);
        self.is_deleted = false;
        self.updated_at = now.max(self.updated_at);
    }

    /// Mark the row deleted. The row itself is retained.
    pub fn tombstone(&mut self, now: u64) {
        self.is_deleted = true;
        self.updated_at = now.max(self.updated_at);
    }

    pub fn scope(&self) -> DesignScope {
        DesignScope::new(self.user_id, self.design_id)
    }

    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}
