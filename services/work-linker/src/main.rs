//!
//! src/main.rs  Andrew Belles  Oct 16th, 2026
//!
//! Loads one page of an artist's recordings, matches the unlinked ones
//! against the artist's works and, when asked to, links every recording
//! to its suggested work.
//!
//!

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use work_linker::config::{self, AppConfig};
use work_linker::fetch::{MusicBrainzClient, MusicBrainzEditor};
use work_linker::logging;
use work_linker::matcher::MatchEvent;
use work_linker::normalize::extract_mbid;
use work_linker::persistent::SqliteStore;
use work_linker::types::Artist;
use work_linker::{Linker, LinkerError, LinkerSettings};

/// sqlite will not create missing parent directories
fn ensure_db_dir(db_url: &str) -> Result<(), LinkerError> {
    let path = db_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
    if path.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

async fn build_linker(cfgs: &AppConfig) -> Result<Linker, LinkerError> {
    ensure_db_dir(&cfgs.persistence.db_url)?;
    let store = SqliteStore::init(&cfgs.persistence.db_url).await?;

    let lookups = MusicBrainzClient::new(&cfgs.http, &cfgs.identity, &cfgs.musicbrainz)?;
    let editor = MusicBrainzEditor::new(&cfgs.http, &cfgs.identity, &cfgs.musicbrainz)?;

    let id = extract_mbid(&cfgs.target.artist_mbid)?;
    let name = match cfgs.target.artist_name.trim() {
        "" => id.to_string(),
        name => name.to_string()
    };

    Ok(Linker::new(
        Artist { id, name },
        Arc::new(lookups),
        Arc::new(editor),
        Arc::new(store),
        LinkerSettings::from(cfgs)
    ))
}

#[tokio::main]
async fn main() -> Result<(), LinkerError> {
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    info!(
        service = "work-linker",
        version = %env!("CARGO_PKG_VERSION"),
        "starting"
    );

    let linker = build_linker(&cfgs).await?;
    if let Some(mut events) = linker.events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MatchEvent::Suggested(s) => info!(
                        recording = %s.recording, work = %s.work.id,
                        title = %s.work.title, score = s.score, "suggestion"
                    ),
                    MatchEvent::NoMatch { recording } => info!(
                        recording = %recording, "suggestion.none"
                    )
                }
            }
        });
    }

    let page = linker.load_recordings(cfgs.target.page).await?;
    let (loaded, performed) = (page.loaded, page.performed);
    for scan in page.scans {
        scan.finished().await;
    }

    let suggested: Vec<_> = linker.suggestions()
        .into_iter()
        .map(|s| s.recording)
        .collect();
    info!(page = cfgs.target.page, loaded, performed, suggested = suggested.len(), "page.matched");

    if cfgs.target.link_suggested && !suggested.is_empty() {
        let report = linker.relate_to_suggested_works(&suggested).await?;
        for (recording, e) in &report.failed {
            warn!(recording = %recording, error = %e, "link.failed");
        }
        info!(
            linked = report.linked.len(),
            already_linked = report.already_linked.len(),
            failed = report.failed.len(),
            "page.linked"
        );
    }

    linker.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_urls_need_no_directory() {
        assert!(ensure_db_dir("sqlite::memory:").is_ok());
    }

    #[test]
    fn creates_parent_directory_of_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/linker.db");
        ensure_db_dir(&format!("sqlite:{}", db.display())).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
