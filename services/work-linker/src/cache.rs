//!
//! src/cache.rs  Andrew Belles  Oct 16th, 2026
//!
//! Per artist snapshot of known works, kept in memory and mirrored to the
//! key/value store. Works discovered one at a time (freshly created or
//! linked by id) are merged into memory immediately and written out in
//! batches. Snapshots are only replaced by an explicit reload.
//!

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::LinkerError;
use crate::matcher::Candidate;
use crate::persistent::KeyValueStore;
use crate::types::{Artist, ArtistId, Work, WorkId};

const WORKS_KEY: &str = "works";
const EXTRA_ARTISTS_KEY: &str = "extra-artists";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedWorks {
    pub fetched_at: DateTime<Utc>,
    pub works: Vec<Work>
}

#[derive(Debug)]
struct ArtistEntry {
    snapshot: CachedWorks,
    pending: usize
}

#[derive(Debug, Default)]
struct CacheState {
    artists: HashMap<ArtistId, ArtistEntry>,
    owner: HashMap<WorkId, ArtistId>,
    candidates: Option<Arc<[Candidate]>>
}

impl CacheState {
    /// Drops the ownership an artist holds over its works, handing each one
    /// to another loaded artist that still lists it
    fn release(&mut self, artist: &ArtistId, works: &[Work]) {
        for w in works {
            if self.owner.get(&w.id) != Some(artist) {
                continue;
            }
            self.owner.remove(&w.id);
            let heir = self.artists.iter()
                .find(|(_, e)| e.snapshot.works.iter().any(|o| o.id == w.id))
                .map(|(a, _)| a.clone());
            if let Some(heir) = heir {
                self.owner.insert(w.id.clone(), heir);
            }
        }
    }

    fn index(&mut self, artist: &ArtistId, snapshot: CachedWorks) {
        if let Some(old) = self.artists.remove(artist) {
            self.release(artist, &old.snapshot.works);
        }
        for w in &snapshot.works {
            self.owner.entry(w.id.clone()).or_insert_with(|| artist.clone());
        }
        self.artists.insert(artist.clone(), ArtistEntry { snapshot, pending: 0 });
        self.candidates = None;
    }
}

pub struct WorkCache {
    store: Arc<dyn KeyValueStore>,
    flush_batch: usize,
    state: Mutex<CacheState>
}

impl WorkCache {
    pub fn new(store: Arc<dyn KeyValueStore>, flush_batch: usize) -> Self {
        Self {
            store,
            flush_batch: flush_batch.max(1),
            state: Mutex::new(CacheState::default())
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot for an artist, from memory or else from the store
    pub async fn get(&self, artist: &ArtistId) -> Result<Option<CachedWorks>, LinkerError> {
        if let Some(entry) = self.state().artists.get(artist) {
            return Ok(Some(entry.snapshot.clone()));
        }

        let Some(raw) = self.store.get(artist.as_str(), WORKS_KEY).await? else {
            return Ok(None);
        };
        let snapshot: CachedWorks = serde_json::from_str(&raw)?;
        debug!(artist = %artist, works = snapshot.works.len(), "cache.load");

        let mut state = self.state();
        // a concurrent put or append wins over the stored copy
        if let Some(entry) = state.artists.get(artist) {
            return Ok(Some(entry.snapshot.clone()));
        }
        state.index(artist, snapshot.clone());
        Ok(Some(snapshot))
    }

    /// Replaces the snapshot for an artist, stamped now
    pub async fn put(&self, artist: &ArtistId, works: Vec<Work>) -> Result<CachedWorks, LinkerError> {
        let mut seen = HashSet::new();
        let works: Vec<Work> = works.into_iter()
            .filter(|w| seen.insert(w.id.clone()))
            .collect();
        let snapshot = CachedWorks { fetched_at: Utc::now(), works };

        self.state().index(artist, snapshot.clone());
        self.store.set(artist.as_str(), WORKS_KEY, &serde_json::to_string(&snapshot)?).await?;
        info!(artist = %artist, works = snapshot.works.len(), "cache.put");
        Ok(snapshot)
    }

    /// Adds one work under an artist. Returns false when the work is
    /// already known under any loaded artist.
    pub async fn append_one(&self, artist: &ArtistId, work: Work) -> Result<bool, LinkerError> {
        // the stored snapshot has to be in memory first or the next flush
        // would overwrite it with the appended works alone
        if !self.state().artists.contains_key(artist) {
            self.get(artist).await?;
        }

        let flush_due = {
            let mut state = self.state();
            if state.owner.contains_key(&work.id) {
                return Ok(false);
            }
            state.owner.insert(work.id.clone(), artist.clone());
            state.candidates = None;

            let entry = state.artists.entry(artist.clone()).or_insert_with(|| ArtistEntry {
                snapshot: CachedWorks { fetched_at: Utc::now(), works: Vec::new() },
                pending: 0
            });
            debug!(artist = %artist, work = %work.id, "cache.append");
            entry.snapshot.works.push(work);
            entry.pending += 1;

            let pending: usize = state.artists.values().map(|e| e.pending).sum();
            pending >= self.flush_batch
        };

        if flush_due {
            self.flush().await?;
        }
        Ok(true)
    }

    /// Writes out every artist with unwritten appends, returning how many
    /// appended works were persisted
    pub async fn flush(&self) -> Result<usize, LinkerError> {
        let dirty: Vec<(ArtistId, usize, String)> = {
            let mut state = self.state();
            let mut dirty = Vec::new();
            for (artist, entry) in state.artists.iter_mut().filter(|(_, e)| e.pending > 0) {
                dirty.push((
                    artist.clone(),
                    entry.pending,
                    serde_json::to_string(&entry.snapshot)?
                ));
                entry.pending = 0;
            }
            dirty
        };

        let mut flushed = 0;
        for (artist, pending, raw) in dirty {
            if let Err(e) = self.store.set(artist.as_str(), WORKS_KEY, &raw).await {
                // put the count back so the next flush retries the artist
                if let Some(entry) = self.state().artists.get_mut(&artist) {
                    entry.pending += pending;
                }
                return Err(e);
            }
            flushed += pending;
        }
        if flushed > 0 {
            info!(works = flushed, "cache.flush");
        }
        Ok(flushed)
    }

    /// Forgets an artist in memory, the stored snapshot is kept
    pub fn unload(&self, artist: &ArtistId) {
        let mut state = self.state();
        if let Some(entry) = state.artists.remove(artist) {
            state.release(artist, &entry.snapshot.works);
            state.candidates = None;
        }
    }

    pub fn loaded(&self, work: &WorkId) -> bool {
        self.state().owner.contains_key(work)
    }

    pub fn loaded_artists(&self) -> Vec<ArtistId> {
        self.state().artists.keys().cloned().collect()
    }

    pub fn pending(&self) -> usize {
        self.state().artists.values().map(|e| e.pending).sum()
    }

    /// Every loaded work prepared for matching, rebuilt after a change
    pub fn candidates(&self) -> Arc<[Candidate]> {
        let mut state = self.state();
        if let Some(c) = &state.candidates {
            return c.clone();
        }
        let mut seen = HashSet::new();
        let built: Arc<[Candidate]> = state.artists.values()
            .flat_map(|e| e.snapshot.works.iter())
            .filter(|w| seen.insert(w.id.clone()))
            .cloned()
            .map(Candidate::from_work)
            .collect();
        state.candidates = Some(built.clone());
        built
    }

    pub async fn extra_artists(&self, owner: &ArtistId) -> Result<Vec<Artist>, LinkerError> {
        match self.store.get(owner.as_str(), EXTRA_ARTISTS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new())
        }
    }

    /// Returns false if the artist was already listed
    pub async fn add_extra_artist(&self, owner: &ArtistId, artist: Artist) -> Result<bool, LinkerError> {
        let mut list = self.extra_artists(owner).await?;
        if list.iter().any(|a| a.id == artist.id) {
            return Ok(false);
        }
        list.push(artist);
        self.store.set(owner.as_str(), EXTRA_ARTISTS_KEY, &serde_json::to_string(&list)?).await?;
        Ok(true)
    }

    pub async fn remove_extra_artist(&self, owner: &ArtistId, artist: &ArtistId) -> Result<bool, LinkerError> {
        let mut list = self.extra_artists(owner).await?;
        let before = list.len();
        list.retain(|a| &a.id != artist);
        if list.len() == before {
            return Ok(false);
        }
        self.store.set(owner.as_str(), EXTRA_ARTISTS_KEY, &serde_json::to_string(&list)?).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent::MemoryStore;
    use crate::types::Mbid;

    fn id(n: u8) -> Mbid {
        Mbid::parse(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).unwrap()
    }

    fn work(n: u8, title: &str) -> Work {
        Work::new(id(n), title, None)
    }

    #[tokio::test]
    async fn put_stamps_and_get_reads_back() -> Result<(), LinkerError> {
        let store = Arc::new(MemoryStore::new());
        let cache = WorkCache::new(store.clone(), 25);
        let artist = id(1);

        assert_eq!(cache.get(&artist).await?, None);

        let before = Utc::now();
        let put = cache.put(&artist, vec![work(10, "A"), work(11, "B"), work(10, "A")]).await?;
        let after = Utc::now();
        assert!(put.fetched_at >= before && put.fetched_at <= after);
        assert_eq!(put.works.len(), 2);
        assert_eq!(cache.get(&artist).await?, Some(put.clone()));

        // a fresh cache over the same store sees the snapshot
        let cold = WorkCache::new(store, 25);
        assert_eq!(cold.get(&artist).await?, Some(put));
        assert!(cold.loaded(&id(11)));
        Ok(())
    }

    #[tokio::test]
    async fn append_one_skips_known_works() -> Result<(), LinkerError> {
        let cache = WorkCache::new(Arc::new(MemoryStore::new()), 25);
        let (a, b) = (id(1), id(2));
        cache.put(&a, vec![work(10, "A")]).await?;
        cache.put(&b, vec![work(20, "B")]).await?;

        assert!(!cache.append_one(&a, work(10, "A")).await?);
        assert!(!cache.append_one(&a, work(20, "B")).await?);
        assert!(cache.append_one(&a, work(30, "C")).await?);
        assert!(!cache.append_one(&b, work(30, "C")).await?);

        let titles: Vec<String> = cache.get(&a).await?.unwrap()
            .works.into_iter().map(|w| w.title).collect();
        assert_eq!(titles, vec!["A", "C"]);
        assert_eq!(cache.candidates().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn appends_are_written_in_batches() -> Result<(), LinkerError> {
        let store = Arc::new(MemoryStore::new());
        let cache = WorkCache::new(store.clone(), 3);
        let artist = id(1);

        cache.append_one(&artist, work(10, "A")).await?;
        cache.append_one(&artist, work(11, "B")).await?;
        assert_eq!(store.writes(), 0);
        assert_eq!(cache.pending(), 2);

        cache.append_one(&artist, work(12, "C")).await?;
        assert_eq!(store.writes(), 1);
        assert_eq!(cache.pending(), 0);

        cache.append_one(&artist, work(13, "D")).await?;
        assert_eq!(cache.flush().await?, 1);
        assert_eq!(cache.flush().await?, 0);
        assert_eq!(store.writes(), 2);

        let cold = WorkCache::new(store, 3);
        assert_eq!(cold.get(&artist).await?.unwrap().works.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn candidates_follow_unload() -> Result<(), LinkerError> {
        let cache = WorkCache::new(Arc::new(MemoryStore::new()), 25);
        cache.put(&id(1), vec![work(10, "Hello, World")]).await?;
        cache.put(&id(2), vec![work(20, "Other")]).await?;

        let all = cache.candidates();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.normalized == "hello,world"));

        cache.unload(&id(2));
        assert_eq!(cache.candidates().len(), 1);
        assert!(!cache.loaded(&id(20)));
        Ok(())
    }

    #[tokio::test]
    async fn extra_artists_are_listed_once() -> Result<(), LinkerError> {
        let cache = WorkCache::new(Arc::new(MemoryStore::new()), 25);
        let owner = id(1);
        let guest = Artist { id: id(2), name: "Guest".into() };

        assert!(cache.add_extra_artist(&owner, guest.clone()).await?);
        assert!(!cache.add_extra_artist(&owner, guest.clone()).await?);
        assert_eq!(cache.extra_artists(&owner).await?, vec![guest]);
        assert!(cache.remove_extra_artist(&owner, &id(2)).await?);
        assert!(!cache.remove_extra_artist(&owner, &id(2)).await?);
        assert!(cache.extra_artists(&owner).await?.is_empty());
        Ok(())
    }
    #[tokio::test]
    async fn append_keeps_the_stored_snapshot() -> Result<(), LinkerError> {
        let store = Arc::new(MemoryStore::new());
        let artist = id(1);
        WorkCache::new(store.clone(), 25)
            .put(&artist, vec![work(10, "A"), work(11, "B")]).await?;

        let cache = WorkCache::new(store.clone(), 25);
        assert!(!cache.append_one(&artist, work(11, "B")).await?);
        assert!(cache.append_one(&artist, work(12, "C")).await?);
        assert_eq!(cache.get(&artist).await?.unwrap().works.len(), 3);
        assert_eq!(cache.flush().await?, 1);

        let cold = WorkCache::new(store, 25);
        let titles: Vec<String> = cold.get(&artist).await?.unwrap()
            .works.into_iter().map(|w| w.title).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        Ok(())
    }

    #[tokio::test]
    async fn shared_works_survive_a_reload() -> Result<(), LinkerError> {
        let cache = WorkCache::new(Arc::new(MemoryStore::new()), 25);
        let (a, b) = (id(1), id(2));
        cache.put(&a, vec![work(10, "Shared")]).await?;
        cache.put(&b, vec![work(10, "Shared")]).await?;
        assert_eq!(cache.candidates().len(), 1);

        cache.put(&b, vec![work(20, "Other")]).await?;
        assert!(cache.loaded(&id(10)));
        assert!(!cache.append_one(&a, work(10, "Shared")).await?);
        assert_eq!(cache.get(&a).await?.unwrap().works.len(), 1);

        // the reload of the first owner hands the work over to the other
        cache.put(&b, vec![work(10, "Shared")]).await?;
        cache.put(&a, vec![]).await?;
        assert!(cache.loaded(&id(10)));
        cache.unload(&b);
        assert!(!cache.loaded(&id(10)));
        assert!(cache.candidates().is_empty());
        Ok(())
    }
}
