//!
//! src/matcher.rs  Andrew Belles  Oct 16th, 2026
//!
//! Fuzzy matching of recording titles against cached works. Each scan is a
//! small state machine stepped one candidate at a time, yielding to the
//! runtime between steps so thousands of candidates never stall the host.
//! An exact match ends the scan early; otherwise the lowest normalized edit
//! distance under the threshold wins.
//!

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MatchConfig;
use crate::ledger::RelationshipLedger;
use crate::normalize::normalize_title;
use crate::types::{RecordingId, Work};

/// A work prepared for comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub work: Work,
    pub normalized: String
}

impl Candidate {
    pub fn from_work(work: Work) -> Self {
        let normalized = normalize_title(&work.title);
        Self { work, normalized }
    }
}

/// Symmetric normalized edit distance, 0 for identical titles
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 0.0;
    }
    let mean_len = (a.chars().count() + b.chars().count()) as f64 / 2.0;
    strsim::levenshtein(a, b) as f64 / mean_len
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanProgress {
    pub current: usize,
    pub total: usize
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanStep {
    Continue,
    Finished
}

/// Best-match search over one candidate list for one title
#[derive(Debug)]
pub struct MatchScan {
    query: String,
    candidates: Arc<[Candidate]>,
    index: usize,
    best_score: f64,
    best: Option<usize>,
    finished: bool
}

impl MatchScan {
    pub fn new(query: impl Into<String>, candidates: Arc<[Candidate]>, threshold: f64) -> Self {
        let finished = candidates.is_empty();
        Self {
            query: query.into(),
            candidates,
            index: 0,
            best_score: threshold,
            best: None,
            finished
        }
    }

    /// Scores the next candidate
    pub fn step(&mut self) -> ScanStep {
        if self.finished {
            return ScanStep::Finished;
        }
        let j = self.index;
        self.index += 1;

        let score = similarity(&self.query, &self.candidates[j].normalized);
        if score < self.best_score {
            self.best = Some(j);
            self.best_score = score;
            if score == 0.0 {
                self.finished = true;
                return ScanStep::Finished;
            }
        }
        if self.index == self.candidates.len() {
            self.finished = true;
            return ScanStep::Finished;
        }
        ScanStep::Continue
    }

    /// Runs to completion without yielding
    pub fn run(&mut self) -> Option<(&Candidate, f64)> {
        while self.step() == ScanStep::Continue {}
        self.result()
    }

    pub fn result(&self) -> Option<(&Candidate, f64)> {
        self.best.map(|j| (&self.candidates[j], self.best_score))
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress { current: self.index, total: self.candidates.len() }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub recording: RecordingId,
    pub work: Work,
    pub score: f64
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    Suggested(Suggestion),
    NoMatch { recording: RecordingId }
}

/// Handle on one running scan
#[derive(Debug)]
pub struct ScanHandle {
    pub recording: RecordingId,
    pub progress: watch::Receiver<ScanProgress>,
    cancel: CancellationToken,
    join: JoinHandle<Option<Suggestion>>
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the scan, yielding the suggestion it delivered if any
    pub async fn finished(self) -> Option<Suggestion> {
        self.join.await.ok().flatten()
    }
}

#[derive(Debug, Default)]
struct EngineState {
    suggestions: HashMap<RecordingId, Suggestion>,
    scans: HashMap<RecordingId, Vec<(u64, CancellationToken)>>,
    next_scan: u64
}

#[derive(Debug)]
struct EngineInner {
    cfg: MatchConfig,
    ledger: RelationshipLedger,
    events: mpsc::UnboundedSender<MatchEvent>,
    state: Mutex<EngineState>
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct MatchEngine {
    inner: Arc<EngineInner>
}

impl MatchEngine {
    pub fn new(cfg: MatchConfig, ledger: RelationshipLedger)
        -> (Self, mpsc::UnboundedReceiver<MatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(EngineInner {
                cfg,
                ledger,
                events,
                state: Mutex::new(EngineState::default())
            })
        };
        (engine, rx)
    }

    /// Starts a background scan for one recording. Performed recordings,
    /// empty candidate lists and recordings that already hold an exact
    /// suggestion are skipped. A scan only reports a work that beats the
    /// current suggestion.
    pub fn match_recording(
        &self,
        recording: RecordingId,
        title: &str,
        candidates: Arc<[Candidate]>
    ) -> Option<ScanHandle> {
        if candidates.is_empty() || self.inner.ledger.is_performed(&recording) {
            return None;
        }

        let cancel = CancellationToken::new();
        let (scan_id, threshold) = {
            let mut state = self.inner.state();
            let threshold = match state.suggestions.get(&recording) {
                Some(s) if s.score == 0.0 => return None,
                Some(s) => s.score.min(self.inner.cfg.threshold),
                None => self.inner.cfg.threshold
            };
            let scan_id = state.next_scan;
            state.next_scan += 1;
            state.scans.entry(recording.clone()).or_default().push((scan_id, cancel.clone()));
            (scan_id, threshold)
        };

        let scan = MatchScan::new(title, candidates, threshold);
        let (progress_tx, progress) = watch::channel(scan.progress());
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(run_scan(
            inner, recording.clone(), scan_id, scan, cancel.clone(), progress_tx
        ));

        Some(ScanHandle { recording, progress, cancel, join })
    }

    /// One scan per recording, `(id, normalized title)` pairs
    pub fn match_all(
        &self,
        recordings: &[(RecordingId, String)],
        candidates: Arc<[Candidate]>
    ) -> Vec<ScanHandle> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let handles: Vec<ScanHandle> = recordings.iter()
            .filter_map(|(id, title)| {
                self.match_recording(id.clone(), title, candidates.clone())
            })
            .collect();
        info!(recordings = handles.len(), candidates = candidates.len(), "match.batch");
        handles
    }

    pub fn suggestion(&self, recording: &RecordingId) -> Option<Suggestion> {
        self.inner.state().suggestions.get(recording).cloned()
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.inner.state().suggestions.values().cloned().collect()
    }

    /// Drops the suggestion and stops any scan once a recording is linked
    pub fn resolve(&self, recording: &RecordingId) {
        let mut state = self.inner.state();
        state.suggestions.remove(recording);
        if let Some(scans) = state.scans.remove(recording) {
            for (_, token) in scans {
                token.cancel();
            }
        }
    }

    pub fn active_scans(&self) -> usize {
        self.inner.state().scans.values().map(Vec::len).sum()
    }
}

async fn run_scan(
    inner: Arc<EngineInner>,
    recording: RecordingId,
    scan_id: u64,
    mut scan: MatchScan,
    cancel: CancellationToken,
    progress: watch::Sender<ScanProgress>
) -> Option<Suggestion> {
    let every = inner.cfg.progress_every.max(1);
    let outcome = loop {
        if cancel.is_cancelled() || inner.ledger.is_performed(&recording) {
            debug!(recording = %recording, "match.cancelled");
            break None;
        }
        let step = scan.step();
        let current = scan.progress();
        if current.current % every == 0 || step == ScanStep::Finished {
            let _ = progress.send(current);
        }
        match step {
            ScanStep::Continue => tokio::task::yield_now().await,
            ScanStep::Finished => break Some(scan.result().map(|(c, s)| (c.work.clone(), s)))
        }
    };

    let mut state = inner.state();
    if let Some(scans) = state.scans.get_mut(&recording) {
        scans.retain(|(id, _)| *id != scan_id);
        if scans.is_empty() {
            state.scans.remove(&recording);
        }
    }

    let Some(found) = outcome else { return None };
    // linked while the last step ran
    if inner.ledger.is_performed(&recording) {
        return None;
    }

    let Some((work, score)) = found else {
        if !state.suggestions.contains_key(&recording) {
            let _ = inner.events.send(MatchEvent::NoMatch { recording: recording.clone() });
        }
        debug!(recording = %recording, "match.none");
        return None;
    };

    if let Some(existing) = state.suggestions.get(&recording) {
        if existing.score <= score {
            return None;
        }
    }

    let suggestion = Suggestion { recording: recording.clone(), work, score };
    state.suggestions.insert(recording.clone(), suggestion.clone());
    info!(
        recording = %recording, work = %suggestion.work.id,
        title = %suggestion.work.title, score, "match.done"
    );
    let _ = inner.events.send(MatchEvent::Suggested(suggestion.clone()));
    Some(suggestion)
}
