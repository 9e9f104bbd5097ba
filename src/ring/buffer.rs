//! Slot arena for a single collection kind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ring::slot::{DetailRow, HeaderRow, RingEntry, SampleHeader};

/// Smallest allowed ring capacity.
pub const MIN_CAPACITY: u32 = 4;

/// Largest allowed ring capacity.
pub const MAX_CAPACITY: u32 = 100_000;

/// Errors raised by ring operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Requested capacity is outside `[MIN_CAPACITY, MAX_CAPACITY]`.
    #[error("ring capacity {requested} out of range [{min}, {max}]")]
    CapacityOutOfRange { requested: u32, min: u32, max: u32 },

    /// Another resize of the same ring is in progress.
    #[error("resize already pending for ring '{0}'")]
    ResizeConflict(String),

    /// No ring exists for the collection kind.
    #[error("unknown collection kind '{0}'")]
    UnknownKind(String),
}

/// Result of a ring write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub slot_id: u32,
    /// Tick that previously occupied the slot, if any.
    pub replaced_tick: Option<u64>,
    /// The replaced sample had not been flushed yet.
    pub overwrote_unflushed: bool,
}

/// Fixed-size storage: `headers[i]` and `details[i]` both belong to slot `i`.
struct Arena {
    headers: Vec<HeaderRow>,
    details: Vec<Vec<DetailRow>>,
    generation: u64,
    /// Highest tick rolled up by the aggregation flush.
    flushed_through: Option<u64>,
    /// Samples overwritten before they were flushed, since the last take.
    lost: u64,
}

impl Arena {
    fn allocate(capacity: u32, generation: u64) -> Self {
        Self {
            headers: (0..capacity).map(HeaderRow::empty).collect(),
            details: vec![Vec::new(); capacity as usize],
            generation,
            flushed_through: None,
            lost: 0,
        }
    }

    fn capacity(&self) -> u32 {
        self.headers.len() as u32
    }

    fn entry(&self, kind: &str, idx: usize) -> Option<RingEntry> {
        let row = &self.headers[idx];
        let (tick, header) = (row.last_write_tick?, row.header.as_ref()?);
        Some(RingEntry {
            kind: kind.to_string(),
            tick,
            slot_id: row.slot_id,
            header: header.clone(),
            details: self.details[idx].clone(),
        })
    }

    fn collect<F>(&self, kind: &str, mut keep: F) -> Vec<RingEntry>
    where
        F: FnMut(u64, &SampleHeader) -> bool,
    {
        let mut entries: Vec<RingEntry> = (0..self.headers.len())
            .filter(|&idx| {
                let row = &self.headers[idx];
                match (row.last_write_tick, row.header.as_ref()) {
                    (Some(tick), Some(header)) => keep(tick, header),
                    _ => false,
                }
            })
            .filter_map(|idx| self.entry(kind, idx))
            .collect();
        entries.sort_by_key(|e| e.tick);
        entries
    }
}

/// Circular buffer of `capacity` slots for one collection kind.
pub struct Ring {
    kind: String,
    arena: RwLock<Arena>,
    resizing: AtomicBool,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Clears the resize flag when the resize finishes, even on early return.
struct ResizeGuard<'a>(&'a AtomicBool);

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Ring {
    /// Allocate a ring with `capacity` empty slots.
    pub fn new(kind: impl Into<String>, capacity: u32) -> Result<Self, RingError> {
        check_capacity(capacity)?;
        Ok(Self {
            kind: kind.into(),
            arena: RwLock::new(Arena::allocate(capacity, 0)),
            resizing: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
    }

    /// Incremented by every resize.
    pub fn generation(&self) -> u64 {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Slot a tick maps to under the current capacity.
    pub fn slot_for(&self, tick: u64) -> u32 {
        (tick % u64::from(self.capacity())) as u32
    }

    /// Write a sample for `tick`, replacing the slot's header and all of its
    /// detail rows. At most `max_details` rows are kept.
    ///
    /// Last write wins: the slot is overwritten regardless of the resident
    /// tick. A write older than the resident tick is logged.
    pub fn write(
        &self,
        tick: u64,
        header: SampleHeader,
        mut details: Vec<DetailRow>,
        max_details: usize,
    ) -> WriteReceipt {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        let slot_id = (tick % u64::from(arena.capacity())) as u32;
        let idx = slot_id as usize;

        let replaced_tick = arena.headers[idx].last_write_tick;
        if let Some(prev) = replaced_tick
            && prev > tick
        {
            tracing::warn!(
                kind = %self.kind,
                slot = slot_id,
                tick,
                resident_tick = prev,
                "Ring write is older than the resident sample"
            );
        }

        let overwrote_unflushed = replaced_tick.is_some_and(|prev| {
            prev != tick && arena.flushed_through.is_none_or(|flushed| prev > flushed)
        });
        if overwrote_unflushed {
            arena.lost += 1;
            tracing::debug!(
                kind = %self.kind,
                slot = slot_id,
                tick,
                lost_tick = ?replaced_tick,
                "Overwrote a sample that was never flushed"
            );
        }

        if details.len() > max_details {
            tracing::debug!(
                kind = %self.kind,
                tick,
                dropped = details.len() - max_details,
                "Truncating detail rows to slot bound"
            );
            details.truncate(max_details);
        }

        arena.headers[idx].last_write_tick = Some(tick);
        arena.headers[idx].header = Some(header);
        arena.details[idx] = details;

        WriteReceipt {
            slot_id,
            replaced_tick,
            overwrote_unflushed,
        }
    }

    /// Record that every tick up to and including `tick` has been flushed.
    /// The watermark never moves backwards.
    pub fn mark_flushed(&self, tick: u64) {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        arena.flushed_through = Some(arena.flushed_through.map_or(tick, |f| f.max(tick)));
    }

    /// Number of samples lost to overwrite since the previous call.
    pub fn take_lost(&self) -> u64 {
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut arena.lost)
    }

    /// Header row of a slot (occupied or not).
    pub fn header_row(&self, slot_id: u32) -> Option<HeaderRow> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.headers.get(slot_id as usize).cloned()
    }

    /// Resident sample in a slot.
    pub fn get(&self, slot_id: u32) -> Option<RingEntry> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        if slot_id >= arena.capacity() {
            return None;
        }
        arena.entry(&self.kind, slot_id as usize)
    }

    /// Resident sample for a tick, if it has not been overwritten.
    pub fn get_tick(&self, tick: u64) -> Option<RingEntry> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        let idx = (tick % u64::from(arena.capacity())) as usize;
        arena.entry(&self.kind, idx).filter(|e| e.tick == tick)
    }

    /// Resident samples captured within `[start, end]`, ordered by tick.
    pub fn read(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RingEntry> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.collect(&self.kind, |_, h| h.captured_at >= start && h.captured_at <= end)
    }

    /// Resident samples with `tick > after`, ordered by tick.
    pub fn entries_after(&self, after: Option<u64>) -> Vec<RingEntry> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.collect(&self.kind, |tick, _| after.is_none_or(|a| tick > a))
    }

    /// Every resident sample, ordered by tick.
    pub fn snapshot(&self) -> Vec<RingEntry> {
        self.entries_after(None)
    }

    /// Number of header rows (always equal to the capacity).
    pub fn header_count(&self) -> usize {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers
            .len()
    }

    /// Number of slots that hold a sample.
    pub fn occupied(&self) -> usize {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers
            .iter()
            .filter(|h| h.last_write_tick.is_some())
            .count()
    }

    /// Lowest resident tick.
    pub fn oldest_tick(&self) -> Option<u64> {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers
            .iter()
            .filter_map(|h| h.last_write_tick)
            .min()
    }

    /// Highest resident tick.
    pub fn newest_tick(&self) -> Option<u64> {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers
            .iter()
            .filter_map(|h| h.last_write_tick)
            .max()
    }

    /// Discard every slot and reallocate the ring at `new_capacity`.
    ///
    /// Buffered history is lost; nothing is migrated.
    pub fn resize(&self, new_capacity: u32) -> Result<(), RingError> {
        check_capacity(new_capacity)?;
        if self
            .resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RingError::ResizeConflict(self.kind.clone()));
        }
        let _guard = ResizeGuard(&self.resizing);

        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        let old_capacity = arena.capacity();
        let discarded = arena
            .headers
            .iter()
            .filter(|h| h.last_write_tick.is_some())
            .count();
        *arena = Arena::allocate(new_capacity, arena.generation + 1);

        tracing::info!(
            kind = %self.kind,
            old_capacity,
            new_capacity,
            discarded,
            "Ring reallocated"
        );
        Ok(())
    }
}

fn check_capacity(capacity: u32) -> Result<(), RingError> {
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
        return Err(RingError::CapacityOutOfRange {
            requested: capacity,
            min: MIN_CAPACITY,
            max: MAX_CAPACITY,
        });
    }
    Ok(())
}
