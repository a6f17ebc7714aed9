use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::LinkerError;
use crate::period::Period;

// MusicBrainz identifier, always stored lowercase hyphenated
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mbid(String);

impl Mbid {
    pub fn parse(s: &str) -> Result<Self, LinkerError> {
        let uuid = uuid::Uuid::parse_str(s.trim())
            .map_err(|e| LinkerError::Validation(format!("invalid mbid {s:?}: {e}")))?;
        Ok(Mbid(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type RecordingId = Mbid;
pub type WorkId = Mbid;
pub type ArtistId = Mbid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: ArtistId,
    pub name: String
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>
}

impl Work {
    pub fn new(id: WorkId, title: impl Into<String>, comment: Option<String>) -> Self {
        let comment = comment.filter(|c| !c.trim().is_empty());
        Self { id, title: title.into(), comment }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerformanceAttribute {
    Partial,
    Live,
    Instrumental,
    Cover
}

impl PerformanceAttribute {
    pub const ALL: [PerformanceAttribute; 4] = [
        PerformanceAttribute::Partial,
        PerformanceAttribute::Live,
        PerformanceAttribute::Instrumental,
        PerformanceAttribute::Cover,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceAttribute::Partial      => "partial",
            PerformanceAttribute::Live         => "live",
            PerformanceAttribute::Instrumental => "instrumental",
            PerformanceAttribute::Cover        => "cover"
        }
    }

    pub fn parse(s: &str) -> Option<PerformanceAttribute> {
        match s.trim().to_lowercase().as_str() {
            "partial"      => Some(PerformanceAttribute::Partial),
            "live"         => Some(PerformanceAttribute::Live),
            "instrumental" => Some(PerformanceAttribute::Instrumental),
            "cover"        => Some(PerformanceAttribute::Cover),
            _ => None
        }
    }

    /// Attribute type gid used by the relationship editor
    pub fn type_gid(self) -> &'static str {
        match self {
            PerformanceAttribute::Live         => "70007db6-a8bc-46d7-a770-80e6a0bb551a",
            PerformanceAttribute::Partial      => "d2b63be6-91ec-426a-987a-30b47f8aae2d",
            PerformanceAttribute::Instrumental => "c031ed4f-c9bb-4394-8cf5-e8ce4db512ae",
            PerformanceAttribute::Cover        => "1e8536bd-6eda-3822-8e78-1c0f4d3d2113"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerformanceAttributes {
    pub partial: bool,
    pub live: bool,
    pub instrumental: bool,
    pub cover: bool
}

impl PerformanceAttributes {
    pub fn set(&mut self, attr: PerformanceAttribute, on: bool) {
        match attr {
            PerformanceAttribute::Partial      => self.partial = on,
            PerformanceAttribute::Live         => self.live = on,
            PerformanceAttribute::Instrumental => self.instrumental = on,
            PerformanceAttribute::Cover        => self.cover = on
        }
    }

    pub fn is_set(&self, attr: PerformanceAttribute) -> bool {
        match attr {
            PerformanceAttribute::Partial      => self.partial,
            PerformanceAttribute::Live         => self.live,
            PerformanceAttribute::Instrumental => self.instrumental,
            PerformanceAttribute::Cover        => self.cover
        }
    }

    /// Selected attributes in editor order (live, partial, instrumental, cover)
    pub fn selected(&self) -> Vec<PerformanceAttribute> {
        [
            PerformanceAttribute::Live,
            PerformanceAttribute::Partial,
            PerformanceAttribute::Instrumental,
            PerformanceAttribute::Cover,
        ]
        .into_iter()
        .filter(|a| self.is_set(*a))
        .collect()
    }
}

/// Optional attributes attached to works created by the linker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkAttributes {
    pub type_id: Option<String>,
    pub language_id: Option<String>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Work,
    Artist,
    Recording
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Work      => "work",
            EntityKind::Artist    => "artist",
            EntityKind::Recording => "recording"
        }
    }
}

/// Minimal view of any entity, name for artists and title for the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: Mbid,
    pub name: String,
    pub comment: Option<String>
}

/// A performance relationship already present on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceLink {
    pub work: Work,
    pub attributes: PerformanceAttributes,
    pub begin: Option<String>
}

/// Recording as returned by the lookup service, with its work relations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecording {
    pub id: RecordingId,
    pub title: String,
    pub comment: Option<String>,
    pub performances: Vec<PerformanceLink>
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPage {
    pub items: Vec<Work>,
    pub total_count: usize
}

/// Per recording form state the caller edits before a bulk link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkOptions {
    pub attributes: PerformanceAttributes,
    pub period: Option<Period>
}
