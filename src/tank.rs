//! `ObjectTank`: the process-wide registry of objects and their parent/child relations
//! (spec.md section 4.1).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::object::{Object, ObjectId, ObjectType};

/// A node in the result of `ObjectTank::tree()` (spec.md section 4.1).
#[derive(Serialize)]
pub struct TreeNode {
    pub id: ObjectId,
    pub children: Vec<TreeNode>,
}

#[derive(Default)]
pub struct ObjectTank {
    next_id: AtomicU64,
    objects: DashMap<ObjectId, Arc<Object>>,
    definitions: DashMap<String, ObjectId>,
    parent_of: DashMap<ObjectId, ObjectId>,
    children_of: DashMap<ObjectId, Vec<ObjectId>>,
    root_id: RwLock<Option<ObjectId>>,
    tearing_down: AtomicBool,
}

impl ObjectTank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_id(&self) -> Option<ObjectId> {
        *self.root_id.read()
    }

    /// Register a freshly constructed object, assigning it the next id. Fails if the
    /// registry is being torn down, if an object with the same definition hash is already
    /// registered, or if registering a second root when one already exists
    /// (spec.md section 3/4.1 invariants).
    pub fn register(&self, obj: Object, parent_id: Option<ObjectId>) -> Result<Arc<Object>> {
        if self.tearing_down.load(Ordering::SeqCst) {
            bail!("object tank is tearing down, cannot register new objects");
        }

        let def_hash = obj.definition_hash();
        if self.definitions.contains_key(&def_hash) {
            bail!("an object with definition hash {} is already registered", def_hash);
        }

        if obj.obj_type.is_root_candidate() && self.root_id.read().is_some() {
            bail!("a root object is already registered");
        }

        if let Some(parent_id) = parent_id {
            if !self.objects.contains_key(&parent_id) {
                bail!("parent object {} is not registered", parent_id);
            }
        }

        let id = ObjectId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let arc = Arc::new(obj.with_id(id));

        self.objects.insert(id, arc.clone());
        self.definitions.insert(def_hash, id);

        if let Some(parent_id) = parent_id {
            self.parent_of.insert(id, parent_id);
            self.children_of.entry(parent_id).or_default().push(id);
        }

        if arc.obj_type.is_root_candidate() {
            *self.root_id.write() = Some(id);
        }

        debug!(object_id = %id, obj_type = %arc.obj_type, "registered object");
        Ok(arc)
    }

    /// Recursively unregisters `id`'s children first, then stops and removes `id` itself
    /// (spec.md section 4.1).
    pub async fn unregister(&self, id: ObjectId) {
        let children = self.children_of.get(&id).map(|v| v.clone()).unwrap_or_default();
        for child in children {
            Box::pin(self.unregister(child)).await;
        }

        let Some((_, obj)) = self.objects.remove(&id) else {
            return;
        };
        obj.stop().await;

        self.definitions.remove(&obj.definition_hash());
        self.children_of.remove(&id);
        if let Some((_, parent_id)) = self.parent_of.remove(&id) {
            if let Some(mut siblings) = self.children_of.get_mut(&parent_id) {
                siblings.retain(|c| *c != id);
            }
        }
        if self.root_id.read().as_ref() == Some(&id) {
            *self.root_id.write() = None;
        }

        debug!(object_id = %id, "unregistered object");
    }

    pub fn find_one(&self, id: ObjectId) -> Option<Arc<Object>> {
        self.objects.get(&id).map(|e| e.clone())
    }

    /// Returns the parent of `obj_or_id`, or `None` if it has no parent, or if its
    /// recorded parent is no longer registered (spec.md section 4.1 invariant: "stale
    /// refs must never be returned").
    pub fn find_parent(&self, id: ObjectId) -> Option<Arc<Object>> {
        let parent_id = *self.parent_of.get(&id)?;
        self.find_one(parent_id)
    }

    pub fn find_children(&self, id: ObjectId) -> Vec<Arc<Object>> {
        self.children_of
            .get(&id)
            .map(|v| v.iter().filter_map(|cid| self.find_one(*cid)).collect())
            .unwrap_or_default()
    }

    pub fn find_all_by_type(&self, obj_type: ObjectType) -> Vec<Arc<Object>> {
        self.objects
            .iter()
            .filter(|e| e.value().obj_type == obj_type)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn find_all_by_types(&self, types: &HashSet<ObjectType>) -> Vec<Arc<Object>> {
        self.objects
            .iter()
            .filter(|e| types.contains(&e.value().obj_type))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all_ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Recursive `{object, children: [...]}` tree rooted at `base_id`, or at `root_id` if
    /// `base_id` is `None` (spec.md section 4.1).
    pub fn tree(&self, base_id: Option<ObjectId>) -> Option<TreeNode> {
        let base = base_id.or_else(|| self.root_id())?;
        self.objects.get(&base)?;
        Some(self.build_tree_node(base))
    }

    fn build_tree_node(&self, id: ObjectId) -> TreeNode {
        let child_ids = self.children_of.get(&id).map(|v| v.clone()).unwrap_or_default();
        TreeNode {
            id,
            children: child_ids
                .into_iter()
                .filter(|cid| self.objects.contains_key(cid))
                .map(|cid| self.build_tree_node(cid))
                .collect(),
        }
    }

    /// Begin teardown: new registrations are rejected from this point on
    /// (spec.md section 5, "torn down atomically on global config change").
    pub fn begin_teardown(&self) {
        self.tearing_down.store(true, Ordering::SeqCst);
    }

    pub fn end_teardown(&self) {
        self.tearing_down.store(false, Ordering::SeqCst);
    }
}
