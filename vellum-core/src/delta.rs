//! Scene deltas: one add/modify/remove instruction per object.

use crate::object::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    Add,
    Modify,
    Remove,
}

/// A transient mutation of a live scene. Never persisted.
///
/// For `add`, `changes` is the full shape description; for `modify` it is the
/// attribute patch; for `remove` it is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub object_id: ObjectId,
    pub op: DeltaOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

impl Delta {
    pub fn add(object_id: ObjectId, description: Value) -> Self {
        Self {
            object_id,
            op: DeltaOp::Add,
            changes: Some(description),
        }
    }

    pub fn modify(object_id: ObjectId, changes: Value) -> Self {
        Self {
            object_id,
            op: DeltaOp::Modify,
            changes: Some(changes),
        }
    }

    pub fn remove(object_id: ObjectId) -> Self {
        Self {
            object_id,
            op: DeltaOp::Remove,
            changes: None,
        }
    }
}
