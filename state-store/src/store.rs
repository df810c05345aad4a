//! Entity snapshot storage
//!
//! [`StateStore`] keeps the latest known [`StateRecord`] per entity id. It is
//! written from exactly two places:
//!
//! - the event dispatch path, one `state_changed` event at a time, in frame
//!   arrival order ([`StateStore::apply_change`])
//! - bulk `get_states` results ([`StateStore::merge_snapshot`]), which may
//!   race with the dispatch path and therefore never replace a record with
//!   an older one, never bring back an entity whose removal was already
//!   applied, and never drop an entity an event created after the fetch
//!   was sent
//!
//! Every ordering decision compares server timestamps only. The store keeps
//! a watermark, the newest server time it has applied, and a tombstone per
//! removed entity.
//!
//! Readers get cloned records and never block writers for long.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hass_api::{Attributes, StateChange, StateRecord};
use parking_lot::RwLock;

use crate::error::{Result, StoreError};

/// What a single write did to the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotUpdate {
    Inserted,
    Replaced,
    Removed,
    /// The write carried nothing new (identical record, or removal of an
    /// unknown entity)
    Unchanged,
}

/// Counters describing a bulk merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Records skipped because the snapshot already held a newer version
    pub kept_newer: usize,
    /// Records skipped because their entity was removed after they were read
    pub kept_removed: usize,
}

/// Latest known state of every entity
pub struct StateStore {
    records: DashMap<String, StateRecord>,
    /// Removed entities and when they were removed; `None` when the removal
    /// carried no timestamp at all
    tombstones: DashMap<String, Option<DateTime<Utc>>>,
    watermark: RwLock<Option<DateTime<Utc>>>,
    refreshed_at: RwLock<Option<Instant>>,
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tombstones: DashMap::new(),
            watermark: RwLock::new(None),
            refreshed_at: RwLock::new(None),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current record, if any
    pub fn get(&self, entity_id: &str) -> Option<StateRecord> {
        self.records.get(entity_id).map(|record| record.value().clone())
    }

    /// Current record or [`StoreError::EntityNotFound`]
    pub fn get_state(&self, entity_id: &str) -> Result<StateRecord> {
        self.get(entity_id)
            .ok_or_else(|| StoreError::EntityNotFound(entity_id.to_string()))
    }

    /// Attributes of the current record or [`StoreError::EntityNotFound`]
    pub fn get_attributes(&self, entity_id: &str) -> Result<Attributes> {
        self.records
            .get(entity_id)
            .map(|record| record.attributes.clone())
            .ok_or_else(|| StoreError::EntityNotFound(entity_id.to_string()))
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.records.contains_key(entity_id)
    }

    /// Known entity ids, sorted
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Records of one domain (`light`, `sensor`, ...), sorted by entity id
    pub fn domain_records(&self, domain: &str) -> Vec<StateRecord> {
        let mut records: Vec<StateRecord> = self
            .records
            .iter()
            .filter(|r| r.value().domain() == domain)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest server timestamp applied so far
    ///
    /// Capture it before sending a bulk fetch and pass it to
    /// [`merge_snapshot`](Self::merge_snapshot).
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.watermark.read()
    }

    fn advance_watermark(&self, at: DateTime<Utc>) {
        let mut watermark = self.watermark.write();
        if watermark.map_or(true, |current| at > current) {
            *watermark = Some(at);
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert or replace a record
    pub fn upsert(&self, record: StateRecord) -> SnapshotUpdate {
        self.advance_watermark(record.last_updated);
        self.tombstones.remove(&record.entity_id);
        match self.records.entry(record.entity_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get() == &record {
                    SnapshotUpdate::Unchanged
                } else {
                    existing.insert(record);
                    SnapshotUpdate::Replaced
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                SnapshotUpdate::Inserted
            }
        }
    }

    /// Remove an entity
    pub fn remove(&self, entity_id: &str) -> Option<StateRecord> {
        self.records.remove(entity_id).map(|(_, record)| record)
    }

    /// Apply a `state_changed` payload
    ///
    /// A missing `new_state` removes the entity; otherwise the new record
    /// replaces whatever was there.
    pub fn apply_change(&self, change: &StateChange) -> SnapshotUpdate {
        self.apply_change_at(change, None)
    }

    /// Apply a `state_changed` payload fired by the server at `fired_at`
    ///
    /// A removal leaves a tombstone stamped with `fired_at`, or with the
    /// removed record's `last_updated` when the event carried no time, so a
    /// bulk fetch read before the removal cannot bring the entity back.
    pub fn apply_change_at(
        &self,
        change: &StateChange,
        fired_at: Option<DateTime<Utc>>,
    ) -> SnapshotUpdate {
        if let Some(at) = fired_at {
            self.advance_watermark(at);
        }
        match &change.new_state {
            Some(record) => self.upsert(record.clone()),
            None => {
                let removed = self.remove(&change.entity_id);
                let removed_at = fired_at
                    .or_else(|| change.old_state.as_ref().map(|old| old.last_updated))
                    .or_else(|| removed.as_ref().map(|record| record.last_updated));
                self.tombstones.insert(change.entity_id.clone(), removed_at);
                match removed {
                    Some(_) => SnapshotUpdate::Removed,
                    None => SnapshotUpdate::Unchanged,
                }
            }
        }
    }

    /// Merge a bulk fetch into the snapshot
    ///
    /// `since` is the [`watermark`](Self::watermark) captured before the
    /// fetch was sent. For every fetched record:
    ///
    /// - a snapshot record with a newer `last_updated` is kept
    /// - an entity removed at or after the record's `last_updated` stays
    ///   removed; a newer record means the entity came back and is inserted
    ///
    /// An entity absent from the fetch is removed only if the snapshot had
    /// already seen its record when the fetch was sent, i.e. its
    /// `last_updated` is not past `since`. Entities created by events that
    /// raced the fetch survive.
    pub fn merge_snapshot(
        &self,
        records: Vec<StateRecord>,
        since: Option<DateTime<Utc>>,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            seen.insert(record.entity_id.clone());

            if let Some(tombstone) = self.tombstones.get(&record.entity_id).map(|t| *t) {
                if tombstone.map_or(true, |removed_at| record.last_updated <= removed_at) {
                    summary.kept_removed += 1;
                    continue;
                }
                self.tombstones.remove(&record.entity_id);
            }

            self.advance_watermark(record.last_updated);
            match self.records.entry(record.entity_id.clone()) {
                Entry::Occupied(mut existing) => {
                    if existing.get().last_updated > record.last_updated {
                        summary.kept_newer += 1;
                    } else if existing.get() != &record {
                        existing.insert(record);
                        summary.replaced += 1;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    summary.inserted += 1;
                }
            }
        }

        let before = self.records.len();
        self.records.retain(|entity_id, record| {
            seen.contains(entity_id) || since.map_or(true, |since| record.last_updated > since)
        });
        summary.removed = before - self.records.len();

        *self.refreshed_at.write() = Some(Instant::now());
        tracing::debug!(
            inserted = summary.inserted,
            replaced = summary.replaced,
            removed = summary.removed,
            kept_newer = summary.kept_newer,
            kept_removed = summary.kept_removed,
            "Merged state snapshot"
        );
        summary
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.clear();
        self.tombstones.clear();
        *self.watermark.write() = None;
        *self.refreshed_at.write() = None;
    }

    // ========================================================================
    // Freshness
    // ========================================================================

    /// Time since the last bulk merge, `None` if there has not been one
    pub fn age(&self) -> Option<Duration> {
        self.refreshed_at.read().map(|at| at.elapsed())
    }

    /// Whether the snapshot was never bulk-loaded or is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age().map_or(true, |age| age > max_age)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("entity_count", &self.records.len())
            .field("age", &self.age())
            .finish()
    }
}
