//! Debug-only registry of live handles.
//!
//! Every handle registers itself on creation and is forgotten once it is
//! completed, cancelled or dropped. Whatever remains in the registry at a
//! quiescent point (end of a test, shutdown hook) is outstanding work.
//!
//! Only compiled with `debug_assertions`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::leak::{HandleKind, Provenance};

/// A handle that has neither completed nor been cancelled yet.
#[derive(Debug, Clone)]
pub struct HandleRecord {
    pub id: Uuid,
    pub kind: HandleKind,
    pub provenance: Provenance,
}

impl HandleRecord {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.provenance.created_at()
    }
}

fn registry() -> &'static DashMap<Uuid, HandleRecord> {
    static REGISTRY: OnceLock<DashMap<Uuid, HandleRecord>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

pub(crate) fn track(id: Uuid, kind: HandleKind, provenance: Provenance) {
    registry().insert(id, HandleRecord { id, kind, provenance });
}

pub(crate) fn forget(id: Uuid) {
    registry().remove(&id);
}

/// Whether the handle with this id is still outstanding.
pub fn is_outstanding(id: Uuid) -> bool {
    registry().contains_key(&id)
}

/// Snapshot of every outstanding handle, oldest first.
pub fn outstanding() -> Vec<HandleRecord> {
    let mut records: Vec<HandleRecord> = registry()
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    records.sort_by_key(HandleRecord::created_at);
    records
}
