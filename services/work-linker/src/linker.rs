//!
//! src/linker.rs  Andrew Belles  Oct 16th, 2026
//!
//! Wires the schedulers, the shared rate window, the ledger, the work cache
//! and the match engine to the remote services. Lookups run on one
//! scheduler and edits on the other; bulk edits hold the lookup scheduler
//! paused until they are done.
//!

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::WorkCache;
use crate::config::{AppConfig, MatchConfig, RateConfig, SchedulerConfig, WORKS_PAGE_LIMIT,
    CACHE_FLUSH_BATCH};
use crate::errors::LinkerError;
use crate::fetch::{EditService, LookupService};
use crate::ledger::RelationshipLedger;
use crate::matcher::{Candidate, MatchEngine, MatchEvent, ScanHandle, Suggestion};
use crate::normalize::{extract_mbid, looks_live, normalize_recording_title};
use crate::period::Period;
use crate::persistent::KeyValueStore;
use crate::rate::RateWindow;
use crate::scheduler::{Priority, Scheduler, TaskKind};
use crate::types::{
    Artist, ArtistId, Entity, EntityKind, LinkOptions, PerformanceAttributes,
    RecordingId, Work, WorkAttributes
};

#[derive(Debug, Clone)]
pub struct LinkerSettings {
    pub rate: RateConfig,
    pub scheduler: SchedulerConfig,
    pub matching: MatchConfig,
    pub flush_batch: usize,
    pub works_page_limit: u32,
    pub work_options: WorkAttributes
}

impl Default for LinkerSettings {
    fn default() -> Self {
        Self {
            rate: RateConfig::default(),
            scheduler: SchedulerConfig::default(),
            matching: MatchConfig::default(),
            flush_batch: CACHE_FLUSH_BATCH,
            works_page_limit: WORKS_PAGE_LIMIT,
            work_options: WorkAttributes::default()
        }
    }
}

impl From<&AppConfig> for LinkerSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            rate: cfg.rate.clone(),
            scheduler: cfg.scheduler.clone(),
            matching: cfg.matching,
            flush_batch: cfg.persistence.flush_batch,
            works_page_limit: cfg.musicbrainz.works_page_limit.max(1),
            work_options: WorkAttributes {
                type_id: cfg.work_options.type_id.clone(),
                language_id: cfg.work_options.language_id.clone()
            }
        }
    }
}

/// A loaded recording and the link options edited for it
#[derive(Debug, Clone)]
pub struct RecordingEntry {
    pub title: String,
    pub normalized: String,
    pub comment: Option<String>,
    pub options: LinkOptions
}

#[derive(Debug)]
pub struct RecordingsPage {
    pub page: u32,
    pub loaded: usize,
    pub performed: usize,
    pub scans: Vec<ScanHandle>
}

#[derive(Debug)]
pub struct ArtistWorks {
    pub artist: ArtistId,
    pub works: usize,
    pub fetched_at: DateTime<Utc>,
    pub scans: Vec<ScanHandle>
}

/// Outcome of a bulk link, per recording
#[derive(Debug, Default)]
pub struct BulkReport {
    pub linked: Vec<RecordingId>,
    pub already_linked: Vec<RecordingId>,
    pub skipped: Vec<RecordingId>,
    pub failed: Vec<(RecordingId, LinkerError)>,
    pub created: Vec<Work>
}

struct PendingLink {
    recording: RecordingId,
    work: Work,
    rx: oneshot::Receiver<Result<(), LinkerError>>
}

async fn settle<T>(rx: oneshot::Receiver<Result<T, LinkerError>>) -> Result<T, LinkerError> {
    rx.await
        .map_err(|_| LinkerError::TransientIo("task dropped before completing".into()))?
}

/// Keeps the lookup scheduler paused while any bulk edit runs
struct BulkGuard<'a> {
    linker: &'a Linker
}

impl<'a> BulkGuard<'a> {
    fn hold(linker: &'a Linker) -> Self {
        if linker.bulk_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            linker.lookup.pause();
        }
        Self { linker }
    }
}

impl Drop for BulkGuard<'_> {
    fn drop(&mut self) {
        if self.linker.bulk_depth.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.linker.lookup.resume();
        }
    }
}

#[derive(Clone)]
pub struct Linker {
    artist: Artist,
    settings: LinkerSettings,
    rate: Arc<RateWindow>,
    lookup: Scheduler,
    edits: Scheduler,
    ledger: RelationshipLedger,
    cache: Arc<WorkCache>,
    engine: MatchEngine,
    lookups: Arc<dyn LookupService>,
    editor: Arc<dyn EditService>,
    recordings: Arc<Mutex<HashMap<RecordingId, RecordingEntry>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<MatchEvent>>>>,
    bulk_depth: Arc<AtomicUsize>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>
}

impl Linker {
    /// Builds every component and starts the rate ticker. Must be called
    /// from within a tokio runtime.
    pub fn new(
        artist: Artist,
        lookups: Arc<dyn LookupService>,
        editor: Arc<dyn EditService>,
        store: Arc<dyn KeyValueStore>,
        settings: LinkerSettings
    ) -> Self {
        let rate = RateWindow::new(settings.rate.clone());
        let ticker = rate.start_ticker();

        let lookup = Scheduler::new(
            TaskKind::Lookup, settings.scheduler.lookup.clone(), rate.clone());
        let edits = Scheduler::new(
            TaskKind::Submission, settings.scheduler.submission.clone(), rate.clone());

        let ledger = RelationshipLedger::new();
        let (engine, events) = MatchEngine::new(settings.matching, ledger.clone());
        let cache = Arc::new(WorkCache::new(store, settings.flush_batch));

        info!(artist = %artist.id, name = %artist.name, "linker.start");
        Self {
            artist,
            settings,
            rate,
            lookup,
            edits,
            ledger,
            cache,
            engine,
            lookups,
            editor,
            recordings: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(Some(events))),
            bulk_depth: Arc::new(AtomicUsize::new(0)),
            ticker: Arc::new(Mutex::new(Some(ticker)))
        }
    }

    fn recordings(&self) -> MutexGuard<'_, HashMap<RecordingId, RecordingEntry>> {
        self.recordings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn artist(&self) -> &Artist {
        &self.artist
    }

    pub fn ledger(&self) -> &RelationshipLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &WorkCache {
        &self.cache
    }

    pub fn recording(&self, id: &RecordingId) -> Option<RecordingEntry> {
        self.recordings().get(id).cloned()
    }

    pub fn lookup_paused(&self) -> bool {
        self.lookup.is_paused()
    }

    pub fn suggestion(&self, recording: &RecordingId) -> Option<Suggestion> {
        self.engine.suggestion(recording)
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.engine.suggestions()
    }

    /// Match engine output, handed out once
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<MatchEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Replaces the attributes and date used when linking a recording.
    /// A malformed date is rejected here and nothing changes.
    pub fn set_options(
        &self,
        recording: &RecordingId,
        attributes: PerformanceAttributes,
        date: Option<&str>
    ) -> Result<(), LinkerError> {
        let period = match date.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => Some(Period::parse(d)?),
            None => None
        };
        let mut recordings = self.recordings();
        let entry = recordings.get_mut(recording)
            .ok_or_else(|| LinkerError::NotFound(format!("recording {recording} not loaded")))?;
        entry.options = LinkOptions { attributes, period };
        Ok(())
    }

    /// Loads one page of the artist's recordings, then the works of the
    /// artist and every extra artist, and matches whatever is unperformed
    pub async fn load_recordings(&self, page: u32) -> Result<RecordingsPage, LinkerError> {
        let lookups = Arc::clone(&self.lookups);
        let artist = self.artist.id.clone();
        let rx = self.lookup.submit(Priority::Normal, move || {
            let lookups = Arc::clone(&lookups);
            let artist = artist.clone();
            async move { lookups.fetch_recordings(&artist, page).await }
        });
        let remote = settle(rx).await?;

        let mut release_checks = Vec::new();
        let mut performed = 0;
        {
            let mut recordings = self.recordings();
            for rec in &remote {
                for perf in &rec.performances {
                    self.ledger.add_link(&rec.id, &perf.work.id);
                }

                if !rec.performances.is_empty() {
                    performed += 1;
                }

                // options edited on an earlier load are kept
                let options = match recordings.get(&rec.id) {
                    Some(entry) => entry.options.clone(),
                    None => {
                        let mut options = LinkOptions::default();
                        if rec.performances.is_empty() {
                            options.attributes.live = looks_live(&rec.title, rec.comment.as_deref());
                            options.period = rec.comment.as_deref().and_then(Period::from_live_comment);
                            if !options.attributes.live {
                                release_checks.push(rec.id.clone());
                            }
                        }
                        options
                    }
                };

                recordings.insert(rec.id.clone(), RecordingEntry {
                    title: rec.title.clone(),
                    normalized: normalize_recording_title(&rec.title),
                    comment: rec.comment.clone(),
                    options
                });
            }
        }
        info!(page, loaded = remote.len(), performed, "recordings.loaded");

        for id in release_checks {
            self.check_live_releases(id);
        }

        let mut artists = vec![self.artist.id.clone()];
        artists.extend(self.cache.extra_artists(&self.artist.id).await?
            .into_iter()
            .map(|a| a.id));
        for artist in &artists {
            self.fetch_artist_works(artist, false).await?;
        }

        let scans = self.match_unperformed(self.cache.candidates());
        Ok(RecordingsPage { page, loaded: remote.len(), performed, scans })
    }

    /// Background lookup that marks a recording live when it appears on
    /// a live release group
    fn check_live_releases(&self, recording: RecordingId) {
        let lookups = Arc::clone(&self.lookups);
        let id = recording.clone();
        let rx = self.lookup.submit(Priority::Normal, move || {
            let lookups = Arc::clone(&lookups);
            let id = id.clone();
            async move { lookups.recording_is_live(&id).await }
        });

        let recordings = Arc::clone(&self.recordings);
        tokio::spawn(async move {
            match settle(rx).await {
                Ok(true) => {
                    let mut recordings = recordings.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(entry) = recordings.get_mut(&recording) {
                        entry.options.attributes.live = true;
                        debug!(recording = %recording, "recording.live");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(recording = %recording, error = %e, "recording.live.failed")
            }
        });
    }

    /// Works of an artist from the cache, or fetched page by page when
    /// absent or on reload
    async fn fetch_artist_works(&self, artist: &ArtistId, reload: bool)
        -> Result<crate::cache::CachedWorks, LinkerError> {
        if !reload {
            if let Some(cached) = self.cache.get(artist).await? {
                debug!(artist = %artist, works = cached.works.len(), "works.cached");
                return Ok(cached);
            }
        }

        let limit = self.settings.works_page_limit;
        let mut works = Vec::new();
        let mut offset = 0_u32;
        loop {
            let lookups = Arc::clone(&self.lookups);
            let id = artist.clone();
            let rx = self.lookup.submit(Priority::Urgent, move || {
                let lookups = Arc::clone(&lookups);
                let id = id.clone();
                async move { lookups.fetch_works(&id, offset, limit).await }
            });
            let page = settle(rx).await?;

            let received = page.items.len();
            works.extend(page.items);
            offset += limit;
            debug!(artist = %artist, received, total = page.total_count, "works.page");
            if received == 0 || offset as usize >= page.total_count {
                break;
            }
        }

        self.cache.put(artist, works).await
    }

    pub async fn load_artist_works(&self, artist: &ArtistId, reload: bool)
        -> Result<ArtistWorks, LinkerError> {
        let cached = self.fetch_artist_works(artist, reload).await?;
        let candidates: Arc<[Candidate]> = cached.works.iter()
            .cloned()
            .map(Candidate::from_work)
            .collect();
        let scans = self.match_unperformed(candidates);
        Ok(ArtistWorks {
            artist: artist.clone(),
            works: cached.works.len(),
            fetched_at: cached.fetched_at,
            scans
        })
    }

    fn match_unperformed(&self, candidates: Arc<[Candidate]>) -> Vec<ScanHandle> {
        let pending: Vec<(RecordingId, String)> = self.recordings()
            .iter()
            .filter(|(id, _)| !self.ledger.is_performed(id))
            .map(|(id, entry)| (id.clone(), entry.normalized.clone()))
            .collect();
        self.engine.match_all(&pending, candidates)
    }

    /// Looks up an entity given as an MBID or a URL containing one
    pub async fn resolve_entity(&self, kind: EntityKind, input: &str) -> Result<Entity, LinkerError> {
        let id = extract_mbid(input)?;
        let lookups = Arc::clone(&self.lookups);
        let rx = self.lookup.submit(Priority::Urgent, move || {
            let lookups = Arc::clone(&lookups);
            let id = id.clone();
            async move { lookups.fetch_entity(kind, &id).await }
        });
        settle(rx).await
    }

    /// Merges another artist's works into matching and remembers it
    pub async fn add_extra_artist(&self, input: &str)
        -> Result<(Artist, Vec<ScanHandle>), LinkerError> {
        let id = extract_mbid(input)?;
        if id == self.artist.id {
            return Err(LinkerError::Validation("extra artist is the page artist".into()));
        }
        let entity = self.resolve_entity(EntityKind::Artist, input).await?;
        let artist = Artist { id: entity.id, name: entity.name };

        let loaded = self.load_artist_works(&artist.id, false).await?;
        self.cache.add_extra_artist(&self.artist.id, artist.clone()).await?;
        info!(artist = %artist.id, name = %artist.name, works = loaded.works, "extra.added");
        Ok((artist, loaded.scans))
    }

    pub async fn remove_extra_artist(&self, artist: &ArtistId) -> Result<bool, LinkerError> {
        let removed = self.cache.remove_extra_artist(&self.artist.id, artist).await?;
        if artist != &self.artist.id {
            self.cache.unload(artist);
        }
        info!(artist = %artist, removed, "extra.removed");
        Ok(removed)
    }

    fn validate_options(&self, recordings: &[RecordingId]) -> Result<(), LinkerError> {
        let entries = self.recordings();
        for id in recordings {
            if let Some(period) = entries.get(id).and_then(|e| e.options.period.as_ref()) {
                period.validate()?;
            }
        }
        Ok(())
    }

    /// Queues one link edit, `AlreadyLinked` when the ledger holds it
    fn submit_link(&self, recording: &RecordingId, work: &Work, priority: Priority)
        -> Result<PendingLink, LinkerError> {
        if self.ledger.has_link(recording, &work.id) {
            return Err(LinkerError::AlreadyLinked {
                recording: recording.to_string(),
                work: work.id.to_string()
            });
        }
        let options = self.recordings()
            .get(recording)
            .map(|e| e.options.clone())
            .unwrap_or_default();
        if let Some(period) = &options.period {
            period.validate()?;
        }

        let editor = Arc::clone(&self.editor);
        let rec = recording.clone();
        let work_id = work.id.clone();
        let rx = self.edits.submit(priority, move || {
            let editor = Arc::clone(&editor);
            let (rec, work_id, options) = (rec.clone(), work_id.clone(), options.clone());
            async move {
                editor.submit_performance_link(
                    &rec, &work_id, &options.attributes, options.period.as_ref()
                ).await
            }
        });

        Ok(PendingLink { recording: recording.clone(), work: work.clone(), rx })
    }

    async fn finish_link(&self, pending: PendingLink) -> Result<(), LinkerError> {
        settle(pending.rx).await?;
        self.ledger.add_link(&pending.recording, &pending.work.id);
        self.engine.resolve(&pending.recording);
        if !self.cache.loaded(&pending.work.id) {
            self.cache.append_one(&self.artist.id, pending.work.clone()).await?;
        }
        info!(recording = %pending.recording, work = %pending.work.id,
            title = %pending.work.title, "link.done");
        Ok(())
    }

    fn queue_link(&self, recording: &RecordingId, work: &Work, priority: Priority,
        pending: &mut Vec<PendingLink>, report: &mut BulkReport) {
        match self.submit_link(recording, work, priority) {
            Ok(p) => pending.push(p),
            Err(LinkerError::AlreadyLinked { .. }) => {
                debug!(recording = %recording, work = %work.id, "link.skip");
                report.already_linked.push(recording.clone());
            }
            Err(e) => report.failed.push((recording.clone(), e))
        }
    }

    async fn finish_all(&self, pending: Vec<PendingLink>, report: &mut BulkReport) {
        for p in pending {
            let recording = p.recording.clone();
            match self.finish_link(p).await {
                Ok(()) => report.linked.push(recording),
                Err(e) => {
                    warn!(recording = %recording, error = %e, "link.failed");
                    report.failed.push((recording, e));
                }
            }
        }
    }

    pub async fn relate_to_existing_work(&self, work_input: &str, recordings: &[RecordingId])
        -> Result<BulkReport, LinkerError> {
        self.validate_options(recordings)?;
        let entity = self.resolve_entity(EntityKind::Work, work_input).await?;
        let work = Work::new(entity.id, entity.name, entity.comment);

        let _bulk = BulkGuard::hold(self);
        let mut report = BulkReport::default();
        let mut pending = Vec::new();
        for recording in recordings {
            self.queue_link(recording, &work, Priority::Normal, &mut pending, &mut report);
        }
        self.finish_all(pending, &mut report).await;
        info!(work = %work.id, linked = report.linked.len(), "bulk.existing.done");
        Ok(report)
    }

    /// Creates one work, then links every recording to it
    pub async fn relate_to_new_work(&self, title: &str, recordings: &[RecordingId])
        -> Result<BulkReport, LinkerError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(LinkerError::Validation("work title is empty".into()));
        }
        self.validate_options(recordings)?;

        let _bulk = BulkGuard::hold(self);
        let work = self.create_work(title, Priority::Normal).await?;
        let mut report = BulkReport { created: vec![work.clone()], ..Default::default() };

        let mut pending = Vec::new();
        for recording in recordings {
            self.queue_link(recording, &work, Priority::Normal, &mut pending, &mut report);
        }
        self.finish_all(pending, &mut report).await;
        self.match_unperformed(Arc::from(vec![Candidate::from_work(work)]));
        Ok(report)
    }

    /// One new work per recording, titled after it. Each link is queued
    /// urgently once its work exists so it lands right behind it.
    pub async fn relate_to_new_works(&self, recordings: &[RecordingId])
        -> Result<BulkReport, LinkerError> {
        self.validate_options(recordings)?;

        let _bulk = BulkGuard::hold(self);
        let mut report = BulkReport::default();
        let mut creating = Vec::new();
        for recording in recordings {
            let Some(entry) = self.recording(recording) else {
                report.skipped.push(recording.clone());
                continue;
            };
            let rx = self.submit_create(&entry.title, Priority::Normal);
            creating.push((recording.clone(), entry.title, rx));
        }

        let mut pending = Vec::new();
        for (recording, title, rx) in creating {
            let work = match self.created_work(&title, rx).await {
                Ok(work) => work,
                Err(e) => {
                    report.failed.push((recording, e));
                    continue;
                }
            };
            report.created.push(work.clone());
            self.queue_link(&recording, &work, Priority::Urgent, &mut pending, &mut report);
        }
        self.finish_all(pending, &mut report).await;

        let fresh: Arc<[Candidate]> = report.created.iter()
            .cloned()
            .map(Candidate::from_work)
            .collect();
        self.match_unperformed(fresh);
        Ok(report)
    }

    /// Links each recording to its current suggestion, recordings without
    /// one are skipped
    pub async fn relate_to_suggested_works(&self, recordings: &[RecordingId])
        -> Result<BulkReport, LinkerError> {
        self.validate_options(recordings)?;

        let _bulk = BulkGuard::hold(self);
        let mut report = BulkReport::default();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for recording in recordings.iter().filter(|r| seen.insert((*r).clone())) {
            match self.engine.suggestion(recording) {
                Some(s) => self.queue_link(recording, &s.work, Priority::Normal,
                    &mut pending, &mut report),
                None => report.skipped.push(recording.clone())
            }
        }
        self.finish_all(pending, &mut report).await;
        Ok(report)
    }

    fn submit_create(&self, title: &str, priority: Priority)
        -> oneshot::Receiver<Result<crate::types::WorkId, LinkerError>> {
        let editor = Arc::clone(&self.editor);
        let attributes = self.settings.work_options.clone();
        let title = title.to_string();
        self.edits.submit(priority, move || {
            let editor = Arc::clone(&editor);
            let (title, attributes) = (title.clone(), attributes.clone());
            async move { editor.create_work(&title, &attributes).await }
        })
    }

    async fn created_work(
        &self,
        title: &str,
        rx: oneshot::Receiver<Result<crate::types::WorkId, LinkerError>>
    ) -> Result<Work, LinkerError> {
        let id = settle(rx).await?;
        let work = Work::new(id, title, None);
        self.cache.append_one(&self.artist.id, work.clone()).await?;
        info!(work = %work.id, title = %work.title, "work.created");
        Ok(work)
    }

    async fn create_work(&self, title: &str, priority: Priority) -> Result<Work, LinkerError> {
        let rx = self.submit_create(title, priority);
        self.created_work(title, rx).await
    }

    /// Flushes pending cache writes and stops the rate ticker
    pub async fn shutdown(&self) -> Result<(), LinkerError> {
        self.cache.flush().await?;
        self.rate.shutdown();
        let ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(error = %e, "rate.ticker.join");
            }
        }
        info!(performed = self.ledger.performed_count(), "linker.stop");
        Ok(())
    }
}
