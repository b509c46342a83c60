//! Mirrored / consistent object registry.
//!
//! Maps each live [`LogicalObjectId`] to its physical instances. Only the
//! control lane inserts or removes entries; every other lane resolves ids
//! under a short read guard and then works on the returned
//! [`ObjectEntry`] without holding the table lock.

use parking_lot::RwLock;
use ranklane_core::{LogicalObjectId, ObjectScope, SymbolKind, VmError, VmResult};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// ObjectEntry
// ---------------------------------------------------------------------------

/// The physical instances of one logical object.
#[derive(Debug)]
pub struct ObjectEntry {
    id: LogicalObjectId,
    kind: SymbolKind,
    scope: ObjectScope,
    instances: RwLock<Vec<Value>>,
}

impl ObjectEntry {
    pub fn id(&self) -> LogicalObjectId {
        self.id
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn scope(&self) -> ObjectScope {
        self.scope
    }

    pub fn instance_count(&self) -> usize {
        self.scope.instance_count()
    }

    /// Consistent objects have one instance that every parallel index
    /// shares; mirrored objects are indexed directly.
    fn slot(&self, parallel_id: usize) -> VmResult<usize> {
        match self.scope {
            ObjectScope::Consistent => Ok(0),
            ObjectScope::Mirrored { parallel_num } if parallel_id < parallel_num => Ok(parallel_id),
            ObjectScope::Mirrored { parallel_num } => Err(VmError::InvalidState(format!(
                "{} has {} instances, no parallel index {}",
                self.id, parallel_num, parallel_id
            ))),
        }
    }

    pub fn read(&self, parallel_id: usize) -> VmResult<Value> {
        let slot = self.slot(parallel_id)?;
        Ok(self.instances.read()[slot].clone())
    }

    pub fn write(&self, parallel_id: usize, value: Value) -> VmResult<()> {
        let slot = self.slot(parallel_id)?;
        self.instances.write()[slot] = value;
        Ok(())
    }

    /// Copy of every instance, in parallel-index order.
    pub fn snapshot(&self) -> Vec<Value> {
        self.instances.read().clone()
    }
}

// ---------------------------------------------------------------------------
// ObjectRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    entries: RwLock<HashMap<LogicalObjectId, Arc<ObjectEntry>>>,
    retired: RwLock<HashSet<LogicalObjectId>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a new entry. A single value is replicated to every instance.
    pub(crate) fn insert(
        &self,
        id: LogicalObjectId,
        kind: SymbolKind,
        scope: ObjectScope,
        mut instances: Vec<Value>,
    ) -> VmResult<Arc<ObjectEntry>> {
        let count = scope.instance_count();
        if instances.len() == 1 && count > 1 {
            let value = instances.remove(0);
            instances = vec![value; count];
        }
        if instances.len() != count {
            return Err(VmError::InvalidInstruction(format!(
                "{} expects {} instances, got {}",
                id,
                count,
                instances.len()
            )));
        }
        if self.retired.read().contains(&id) {
            return Err(VmError::InvalidState(format!(
                "{} was deleted and cannot be registered again",
                id
            )));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(VmError::InvalidState(format!("{} is already registered", id)));
        }
        let entry = Arc::new(ObjectEntry {
            id,
            kind,
            scope,
            instances: RwLock::new(instances),
        });
        entries.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop the entry and tombstone the id. Returns the removed entry, if
    /// there was one.
    pub(crate) fn remove(&self, id: LogicalObjectId) -> Option<Arc<ObjectEntry>> {
        let removed = self.entries.write().remove(&id);
        self.retired.write().insert(id);
        removed
    }

    /// Look up a live entry.
    pub fn resolve(&self, id: LogicalObjectId) -> VmResult<Arc<ObjectEntry>> {
        if let Some(entry) = self.entries.read().get(&id) {
            return Ok(Arc::clone(entry));
        }
        if self.retired.read().contains(&id) {
            Err(VmError::InvalidState(format!(
                "{} was deleted; ids are never reused",
                id
            )))
        } else {
            Err(VmError::InvalidState(format!("{} is not registered", id)))
        }
    }

    pub fn is_live(&self, id: LogicalObjectId) -> bool {
        self.entries.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every remaining entry. Called once the lanes are joined.
    pub(crate) fn teardown(&self) -> usize {
        let mut entries = self.entries.write();
        let count = entries.len();
        self.retired.write().extend(entries.keys().copied());
        entries.clear();
        count
    }
}
