//!
//! src/ledger.rs  Andrew Belles  Oct 16th, 2026
//!
//! Local record of which works each recording is already a performance of.
//! Consulted before an edit is queued so repeated triggers never reach the
//! edit service once a link has been observed. Two submissions queued before
//! either lands are not deduplicated here.
//!

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::types::{RecordingId, WorkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddLink {
    pub added: bool
}

#[derive(Debug, Default)]
struct RecordingLinks {
    works: Vec<WorkId>,
    performed: bool
}

#[derive(Debug, Clone, Default)]
pub struct RelationshipLedger {
    inner: Arc<Mutex<HashMap<RecordingId, RecordingLinks>>>
}

impl RelationshipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, HashMap<RecordingId, RecordingLinks>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_link(&self, recording: &RecordingId, work: &WorkId) -> bool {
        self.links()
            .get(recording)
            .map(|r| r.works.contains(work))
            .unwrap_or(false)
    }

    /// Records the link and marks the recording performed. A repeated
    /// link is a no-op reported as `added: false`.
    pub fn add_link(&self, recording: &RecordingId, work: &WorkId) -> AddLink {
        let mut links = self.links();
        let entry = links.entry(recording.clone()).or_default();
        if entry.works.contains(work) {
            return AddLink { added: false };
        }
        entry.works.push(work.clone());
        entry.performed = true;
        debug!(recording = %recording, work = %work, linked = entry.works.len(), "ledger.add");
        AddLink { added: true }
    }

    pub fn is_performed(&self, recording: &RecordingId) -> bool {
        self.links()
            .get(recording)
            .map(|r| r.performed)
            .unwrap_or(false)
    }

    /// Linked works in the order they were observed
    pub fn works(&self, recording: &RecordingId) -> Vec<WorkId> {
        self.links()
            .get(recording)
            .map(|r| r.works.clone())
            .unwrap_or_default()
    }

    pub fn performed_count(&self) -> usize {
        self.links().values().filter(|r| r.performed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mbid;

    fn id(n: u8) -> Mbid {
        Mbid::parse(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).unwrap()
    }

    #[test]
    fn add_link_is_idempotent() {
        let ledger = RelationshipLedger::new();
        let (rec, work) = (id(1), id(2));

        assert!(!ledger.is_performed(&rec));
        assert_eq!(ledger.add_link(&rec, &work), AddLink { added: true });
        assert!(ledger.is_performed(&rec));
        assert_eq!(ledger.add_link(&rec, &work), AddLink { added: false });
        assert_eq!(ledger.works(&rec), vec![work.clone()]);
        assert!(ledger.has_link(&rec, &work));
        assert_eq!(ledger.performed_count(), 1);
    }

    #[test]
    fn keeps_link_order_per_recording() {
        let ledger = RelationshipLedger::new();
        let rec = id(1);
        ledger.add_link(&rec, &id(3));
        ledger.add_link(&rec, &id(2));
        ledger.add_link(&rec, &id(3));
        assert_eq!(ledger.works(&rec), vec![id(3), id(2)]);
        assert!(!ledger.has_link(&id(9), &id(3)));
    }

    #[test]
    fn clones_share_state() {
        let ledger = RelationshipLedger::new();
        let other = ledger.clone();
        other.add_link(&id(1), &id(2));
        assert!(ledger.has_link(&id(1), &id(2)));
    }
}
