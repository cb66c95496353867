//! Ordered record collection with a per-record status map.
//!
//! Clients address records by position, which shifts on every delete. Work
//! that outlives a single request (probes, playback sessions) holds a
//! [`RecordId`] instead and asks the store for the current position when its
//! result comes back.

use std::collections::{BTreeMap, HashMap};

use crate::error::StreamError;
use crate::protocol::{StreamQuery, StreamStatus};
use crate::record::{validate, StreamRecord};

/// Stable key of a record for as long as it stays in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

#[derive(Debug, Default)]
pub struct StreamStore {
    entries: Vec<(RecordId, StreamRecord)>,
    statuses: HashMap<RecordId, StreamStatus>,
    next_id: u64,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId(self.next_id)
    }

    fn check_index(&self, index: usize) -> Result<(), StreamError> {
        if index < self.entries.len() {
            Ok(())
        } else {
            Err(StreamError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })
        }
    }

    /// Replace the whole collection. Statuses are cleared; ids are never
    /// reused so results still in flight for the old records go nowhere.
    pub fn load(&mut self, records: Vec<StreamRecord>) {
        self.statuses.clear();
        let mut entries = Vec::with_capacity(records.len());
        for r in records {
            entries.push((self.allocate(), r));
        }
        self.entries = entries;
    }

    /// Append a validated record and return its index.
    pub fn add(&mut self, record: StreamRecord) -> Result<usize, StreamError> {
        validate(&record)?;
        let id = self.allocate();
        self.entries.push((id, record));
        Ok(self.entries.len() - 1)
    }

    /// Replace the record at `index`. Its status survives unless the URL
    /// changed, since the old verdict says nothing about the new URL.
    pub fn update(&mut self, index: usize, record: StreamRecord) -> Result<(), StreamError> {
        self.check_index(index)?;
        validate(&record)?;
        let (id, slot) = &mut self.entries[index];
        if slot.url != record.url {
            self.statuses.remove(id);
        }
        *slot = record;
        Ok(())
    }

    /// Remove the record at `index`; later records (and their statuses)
    /// move down by one.
    pub fn delete(&mut self, index: usize) -> Result<(RecordId, StreamRecord), StreamError> {
        self.check_index(index)?;
        let (id, record) = self.entries.remove(index);
        self.statuses.remove(&id);
        Ok((id, record))
    }

    pub fn get(&self, index: usize) -> Option<&StreamRecord> {
        self.entries.get(index).map(|(_, r)| r)
    }

    pub fn id_at(&self, index: usize) -> Option<RecordId> {
        self.entries.get(index).map(|(id, _)| *id)
    }

    /// Current position of `id`, or `None` once it has been deleted.
    pub fn index_of(&self, id: RecordId) -> Option<usize> {
        self.entries.iter().position(|(i, _)| *i == id)
    }

    pub fn records(&self) -> impl Iterator<Item = &StreamRecord> {
        self.entries.iter().map(|(_, r)| r)
    }

    pub fn to_vec(&self) -> Vec<StreamRecord> {
        self.records().cloned().collect()
    }

    /// `(id, url)` for every record in collection order.
    pub fn targets(&self) -> Vec<(RecordId, String)> {
        self.entries
            .iter()
            .map(|(id, r)| (*id, r.url.clone()))
            .collect()
    }

    /// Set or clear the status of a live record. Returns its index, or `None`
    /// if the record is gone and nothing was written.
    pub fn set_status(&mut self, id: RecordId, status: Option<StreamStatus>) -> Option<usize> {
        let index = self.index_of(id)?;
        match status {
            Some(s) => self.statuses.insert(id, s),
            None => self.statuses.remove(&id),
        };
        Some(index)
    }

    pub fn status(&self, index: usize) -> Option<StreamStatus> {
        let id = self.id_at(index)?;
        self.statuses.get(&id).copied()
    }

    /// The status map as clients see it: index to label.
    pub fn statuses(&self) -> BTreeMap<usize, StreamStatus> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, (id, _))| self.statuses.get(id).map(|s| (i, *s)))
            .collect()
    }

    /// Case-insensitive substring filters, AND-combined, with an optional
    /// case-insensitive sort on one column.
    pub fn records_matching(&self, query: &StreamQuery) -> Vec<(usize, &StreamRecord)> {
        filter_records(self.records(), query)
    }
}

/// Query a plain record list, e.g. a published snapshot. Indices in the
/// result are positions in the input.
pub fn filter_records<'a>(
    records: impl IntoIterator<Item = &'a StreamRecord>,
    query: &StreamQuery,
) -> Vec<(usize, &'a StreamRecord)> {
    let needle = |f: &Option<String>| {
        f.as_deref()
            .map(str::to_lowercase)
            .filter(|s| !s.is_empty())
    };
    let name = needle(&query.name);
    let genre = needle(&query.genre);
    let language = needle(&query.language);

    let hit = |field: &str, filter: &Option<String>| match filter {
        Some(f) => field.to_lowercase().contains(f.as_str()),
        None => true,
    };

    let mut rows: Vec<(usize, &StreamRecord)> = records
        .into_iter()
        .enumerate()
        .filter(|(_, r)| hit(&r.name, &name) && hit(&r.genre, &genre) && hit(&r.language, &language))
        .collect();

    if let Some(column) = query.sort {
        rows.sort_by_cached_key(|(_, r)| r.column(column).to_lowercase());
        if query.desc {
            rows.reverse();
        }
    }
    rows
}
