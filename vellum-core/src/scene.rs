//! Id-indexed scene graph.
//!
//! ```text
//!  entries:  HashMap<ObjectId, SceneEntry>      O(1) lookup / insert / remove
//!  z_order:  BTreeSet<(z_index, ObjectId)>       paint order, ties by id
//!  children: HashMap<parent, BTreeSet<child>>    hierarchy queries
//!  active:   Option<ObjectId>                    at most one
//! ```
//!
//! Paint order comes only from each shape's `zIndex`; insertion order never
//! matters.

use crate::object::ObjectId;
use crate::shape::Shape;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct SceneEntry {
    pub object_id: ObjectId,
    pub shape: Shape,
}

impl SceneEntry {
    pub fn new(object_id: ObjectId, shape: Shape) -> Self {
        Self { object_id, shape }
    }
}

/// Container the delta renderer materializes entries into.
pub trait SceneGraph: Send {
    /// Insert or replace an entry. Returns the replaced entry, if any.
    fn insert(&mut self, entry: SceneEntry) -> Option<SceneEntry>;

    /// Detach an entry. Clears the active pointer if it pointed at it.
    fn remove(&mut self, id: &ObjectId) -> Option<SceneEntry>;

    fn get(&self, id: &ObjectId) -> Option<&SceneEntry>;

    /// Swap in a new shape for an existing entry and re-index it.
    /// Returns `false` when no entry exists.
    fn update(&mut self, id: &ObjectId, shape: Shape) -> bool;

    /// Point the active marker at `id` (or clear it with `None`).
    /// Returns `false` and leaves the marker untouched when `id` is absent.
    fn set_active(&mut self, id: Option<ObjectId>) -> bool;

    fn active(&self) -> Option<ObjectId>;

    /// Entries in paint order (lowest `zIndex` first).
    fn ordered(&self) -> Vec<&SceneEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug, Default)]
pub struct Scene {
    entries: HashMap<ObjectId, SceneEntry>,
    z_order: BTreeSet<(i64, ObjectId)>,
    children: HashMap<ObjectId, BTreeSet<ObjectId>>,
    active: Option<ObjectId>,
    activations: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids whose `parentId` names `parent`, in id order.
    pub fn children_of(&self, parent: &ObjectId) -> Vec<ObjectId> {
        self.children
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How many times an entry has been marked active, re-applications included.
    pub fn activation_count(&self) -> u64 {
        self.activations
    }

    fn index(&mut self, entry: &SceneEntry) {
        self.z_order.insert((entry.shape.z_index, entry.object_id));
        if let Some(parent) = entry.shape.parent_id {
            self.children.entry(parent).or_default().insert(entry.object_id);
        }
    }

    fn unindex(&mut self, entry: &SceneEntry) {
        self.z_order.remove(&(entry.shape.z_index, entry.object_id));
        if let Some(parent) = entry.shape.parent_id {
            if let Some(set) = self.children.get_mut(&parent) {
                set.remove(&entry.object_id);
                if set.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
    }
}

impl SceneGraph for Scene {
    fn insert(&mut self, entry: SceneEntry) -> Option<SceneEntry> {
        let previous = self.entries.remove(&entry.object_id);
        if let Some(prev) = &previous {
            self.unindex(prev);
        }
        self.index(&entry);
        self.entries.insert(entry.object_id, entry);
        previous
    }

    fn remove(&mut self, id: &ObjectId) -> Option<SceneEntry> {
        let entry = self.entries.remove(id)?;
        self.unindex(&entry);
        if self.active == Some(*id) {
            self.active = None;
        }
        Some(entry)
    }

    fn get(&self, id: &ObjectId) -> Option<&SceneEntry> {
        self.entries.get(id)
    }

    fn update(&mut self, id: &ObjectId, shape: Shape) -> bool {
        let Some(mut entry) = self.entries.remove(id) else {
            return false;
        };
        self.unindex(&entry);
        entry.shape = shape;
        self.index(&entry);
        self.entries.insert(*id, entry);
        true
    }

    fn set_active(&mut self, id: Option<ObjectId>) -> bool {
        match id {
            None => {
                self.active = None;
                true
            }
            Some(id) if self.entries.contains_key(&id) => {
                self.active = Some(id);
                self.activations += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn active(&self) -> Option<ObjectId> {
        self.active
    }

    fn ordered(&self) -> Vec<&SceneEntry> {
        self.z_order
            .iter()
            .filter_map(|(_, id)| self.entries.get(id))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::hydrate;
    use serde_json::json;
    use uuid::Uuid;

    fn entry(id: ObjectId, z: i64) -> SceneEntry {
        SceneEntry::new(id, hydrate(&json!({"type": "rect", "zIndex": z})).unwrap())
    }

    #[test]
    fn test_insert_get_remove() {
        let mut scene = Scene::new();
        let id = Uuid::new_v4();
        assert!(scene.insert(entry(id, 0)).is_none());
        assert!(scene.contains(&id));
        assert_eq!(scene.len(), 1);
        assert!(scene.remove(&id).is_some());
        assert!(scene.remove(&id).is_none());
        assert!(scene.is_empty());
    }

    #[test]
    fn test_order_follows_z_index_not_insertion() {
        let mut scene = Scene::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        scene.insert(entry(a, 5));
        scene.insert(entry(b, -1));
        scene.insert(entry(c, 2));
        let order: Vec<_> = scene.ordered().iter().map(|e| e.object_id).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let mut scene = Scene::new();
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for id in &ids {
            scene.insert(entry(*id, 1));
        }
        ids.sort();
        let order: Vec<_> = scene.ordered().iter().map(|e| e.object_id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_update_reindexes() {
        let mut scene = Scene::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        scene.insert(entry(a, 0));
        scene.insert(entry(b, 1));
        let mut raised = scene.get(&a).unwrap().shape.clone();
        raised.merge(&json!({"zIndex": 9})).unwrap();
        assert!(scene.update(&a, raised));
        let order: Vec<_> = scene.ordered().iter().map(|e| e.object_id).collect();
        assert_eq!(order, vec![b, a]);
        assert!(!scene.update(&Uuid::new_v4(), entry(a, 0).shape));
    }

    #[test]
    fn test_replace_does_not_duplicate_order() {
        let mut scene = Scene::new();
        let id = Uuid::new_v4();
        scene.insert(entry(id, 0));
        assert!(scene.insert(entry(id, 3)).is_some());
        assert_eq!(scene.ordered().len(), 1);
        assert_eq!(scene.ordered()[0].shape.z_index, 3);
    }

    #[test]
    fn test_active_pointer() {
        let mut scene = Scene::new();
        let id = Uuid::new_v4();
        assert!(!scene.set_active(Some(id)));
        scene.insert(entry(id, 0));
        assert!(scene.set_active(Some(id)));
        assert_eq!(scene.active(), Some(id));
        scene.remove(&id);
        assert_eq!(scene.active(), None);
    }

    #[test]
    fn test_children_index() {
        let mut scene = Scene::new();
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        let shape = hydrate(&json!({"type": "rect", "parentId": parent.to_string()})).unwrap();
        scene.insert(SceneEntry::new(child, shape));
        assert_eq!(scene.children_of(&parent), vec![child]);
        scene.remove(&child);
        assert!(scene.children_of(&parent).is_empty());
    }
}
