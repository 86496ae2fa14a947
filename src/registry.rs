//! In-memory registry of every station seen across refresh cycles.
//!
//! Stations are keyed by [`StationKey`]. Merging a record whose key is
//! already present merges its samples into the existing entry, so sample
//! history accumulates over the lifetime of the process. Stations are never
//! removed; a station that drops out of its feed keeps its last known data.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::station::{Reference, StationKey, StationRecord};

/// Stations in insertion order plus an index by identity.
#[derive(Debug, Default)]
struct Entries {
    stations: Vec<StationRecord>,
    index: HashMap<StationKey, usize>,
}

impl Entries {
    fn get(&self, key: &StationKey) -> Option<&StationRecord> {
        self.index.get(key).map(|&i| &self.stations[i])
    }
}

/// Registry of stations merged from all sources.
#[derive(Debug, Default)]
pub struct StationRegistry {
    entries: RwLock<Entries>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge records into the registry.
    ///
    /// Known stations get the incoming samples (replacing temperatures at
    /// equal timestamps) and the incoming refresh metadata. Unknown stations
    /// are inserted as they are.
    pub fn merge_stations(&self, records: &[StationRecord]) {
        let mut entries = self.write();
        let Entries { stations, index } = &mut *entries;
        let mut inserted = 0;

        for record in records {
            let key = record.key();
            match index.get(&key).copied() {
                Some(i) => {
                    let existing = &mut stations[i];
                    existing.merge_samples(record);
                    existing.refreshed_at = record.refreshed_at.or(existing.refreshed_at);
                    existing.next_refresh = record.next_refresh.or(existing.next_refresh);
                    existing.error = record.error.clone();
                    if record.number.is_some() {
                        existing.number = record.number.clone();
                    }
                }
                None => {
                    index.insert(key, stations.len());
                    stations.push(record.clone());
                    inserted += 1;
                }
            }
        }

        debug!(
            "Merged {} records, {} new, {} stations total",
            records.len(),
            inserted,
            stations.len()
        );
    }

    /// Station with exactly this identity.
    pub fn find_by_id(&self, key: &StationKey) -> Option<StationRecord> {
        self.read().get(key).cloned()
    }

    /// First station with this name, regardless of site and source.
    pub fn find_by_name(&self, name: &str) -> Option<StationRecord> {
        self.read().stations.iter().find(|s| s.name == name).cloned()
    }

    /// Re-locate a persisted reference.
    ///
    /// Tries the full identity first, then name and site, then name, then site.
    pub fn resolve(&self, reference: &Reference) -> Option<StationRecord> {
        let entries = self.read();

        if let Some(key) = reference.station_key()
            && let Some(station) = entries.get(&key)
        {
            return Some(station.clone());
        }

        let name = reference.station_name.as_deref();
        let site = reference.station_site.as_deref();

        crate::source::find_station(&entries.stations, name, site).cloned()
    }

    /// Snapshot of all stations, in insertion order.
    pub fn stations(&self) -> Vec<StationRecord> {
        self.read().stations.clone()
    }

    /// Browse list of all stations, sorted by key.
    pub fn references(&self) -> Vec<Reference> {
        let mut references: Vec<Reference> = self
            .read()
            .stations
            .iter()
            .map(StationRecord::to_reference)
            .collect();
        references.sort_by(|a, b| a.key().cmp(&b.key()));
        references
    }

    pub fn len(&self) -> usize {
        self.read().stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().stations.is_empty()
    }
}
