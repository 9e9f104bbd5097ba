//! Per-kind ring registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::ring::buffer::{Ring, RingError};

/// Holds one [`Ring`] per collection kind.
///
/// Rings are created lazily on first use with the capacity supplied by the
/// caller; later capacity changes go through [`RingStore::resize`].
#[derive(Debug, Default)]
pub struct RingStore {
    rings: RwLock<HashMap<String, Arc<Ring>>>,
}

impl RingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the ring for `kind`, allocating it with `capacity` slots if absent.
    pub fn ring(&self, kind: &str, capacity: u32) -> Result<Arc<Ring>, RingError> {
        if let Some(ring) = self.get(kind) {
            return Ok(ring);
        }

        let mut rings = self.rings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ring) = rings.get(kind) {
            return Ok(Arc::clone(ring));
        }
        let ring = Arc::new(Ring::new(kind, capacity)?);
        rings.insert(kind.to_string(), Arc::clone(&ring));
        tracing::info!(kind, capacity, "Ring allocated");
        Ok(ring)
    }

    /// Get an existing ring.
    pub fn get(&self, kind: &str) -> Option<Arc<Ring>> {
        self.rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// All rings, ordered by kind.
    pub fn rings(&self) -> Vec<Arc<Ring>> {
        let mut rings: Vec<Arc<Ring>> = self
            .rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        rings.sort_by(|a, b| a.kind().cmp(b.kind()));
        rings
    }

    /// Known collection kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.rings().iter().map(|r| r.kind().to_string()).collect()
    }

    /// Destructively resize the ring for `kind`.
    pub fn resize(&self, kind: &str, new_capacity: u32) -> Result<(), RingError> {
        let ring = self
            .get(kind)
            .ok_or_else(|| RingError::UnknownKind(kind.to_string()))?;
        ring.resize(new_capacity)
    }

    /// Resize every ring whose capacity differs from `capacity`.
    ///
    /// Returns the kinds that were reallocated. A conflict on one ring does not
    /// stop the others.
    pub fn reconcile_capacity(&self, capacity: u32) -> Vec<String> {
        let mut resized = Vec::new();
        for ring in self.rings() {
            if ring.capacity() == capacity {
                continue;
            }
            match ring.resize(capacity) {
                Ok(()) => resized.push(ring.kind().to_string()),
                Err(e) => {
                    tracing::warn!(kind = ring.kind(), error = %e, "Ring resize skipped");
                }
            }
        }
        resized
    }
}
