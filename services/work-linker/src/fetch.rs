//!
//! src/fetch.rs  Andrew Belles  Oct 16th, 2026
//!
//! Remote collaborators of the linker. Lookups go through the musicbrainz
//! json web service, edits are posted as form data to the website using
//! the session cookie of a logged in editor. Neither retries on its own,
//! failures surface as errors and the scheduler decides.
//!

use async_trait::async_trait;
use reqwest::{Client, header, redirect, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::{HttpConfig, IdentityConfig, MusicBrainzConfig};
use crate::errors::LinkerError;
use crate::normalize::extract_mbid;
use crate::period::Period;
use crate::types::{
    ArtistId, Entity, EntityKind, Mbid, PerformanceAttribute, PerformanceAttributes,
    PerformanceLink, RecordingId, RemoteRecording, Work, WorkAttributes, WorkId, WorkPage
};

/// Relationship type of "recording is a performance of work"
const PERFORMANCE_LINK_TYPE: &str = "278";

#[async_trait]
pub trait LookupService: Send + Sync {
    /// One page (1 based) of an artist's recordings with their work relations
    async fn fetch_recordings(&self, artist: &ArtistId, page: u32)
        -> Result<Vec<RemoteRecording>, LinkerError>;

    async fn fetch_works(&self, artist: &ArtistId, offset: u32, limit: u32)
        -> Result<WorkPage, LinkerError>;

    async fn fetch_entity(&self, kind: EntityKind, id: &Mbid) -> Result<Entity, LinkerError>;

    /// True if any release group the recording appears on is a live album
    async fn recording_is_live(&self, recording: &RecordingId) -> Result<bool, LinkerError>;
}

#[async_trait]
pub trait EditService: Send + Sync {
    async fn create_work(&self, title: &str, attributes: &WorkAttributes)
        -> Result<WorkId, LinkerError>;

    async fn submit_performance_link(
        &self,
        recording: &RecordingId,
        work: &WorkId,
        attributes: &PerformanceAttributes,
        period: Option<&Period>
    ) -> Result<(), LinkerError>;
}

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(
    http: &HttpConfig,
    headers: header::HeaderMap,
    user_agent: &str
) -> Result<Client, LinkerError> {
    client_helper(http)
        .default_headers(headers)
        .user_agent(user_agent)
        .build()
        .map_err(|e| LinkerError::Config(format!("build client: {e}")))
}

fn join(base: &Url, path: &str) -> Result<Url, LinkerError> {
    base.join(path).map_err(|e| LinkerError::Config(format!("bad url {path}: {e}")))
}

/// 429 and 5xx are worth another attempt, the rest of the 4xx range is not
async fn check_status(resp: Response) -> Result<Response, LinkerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(LinkerError::TransientIo(format!("{status} {url}"))),
        s if s.is_server_error() => Err(LinkerError::TransientIo(format!("{s} {url}"))),
        StatusCode::NOT_FOUND => Err(LinkerError::NotFound(url)),
        s => Err(LinkerError::Validation(format!("{s} {url}")))
    }
}

/// Web service payloads, only the fields the linker reads
mod model {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct RecordingList {
        #[serde(default)]
        pub recordings: Vec<Recording>
    }

    #[derive(Debug, Deserialize)]
    pub struct Recording {
        pub id: String,
        pub title: String,
        #[serde(default)]
        pub disambiguation: String,
        #[serde(default)]
        pub relations: Vec<Relation>
    }

    #[derive(Debug, Deserialize)]
    pub struct Relation {
        #[serde(rename = "type", default)]
        pub kind: String,
        #[serde(default)]
        pub attributes: Vec<String>,
        pub begin: Option<String>,
        pub work: Option<Work>
    }

    #[derive(Debug, Deserialize)]
    pub struct Work {
        pub id: String,
        pub title: String,
        #[serde(default)]
        pub disambiguation: String
    }

    #[derive(Debug, Deserialize)]
    pub struct WorkList {
        #[serde(default)]
        pub works: Vec<Work>,
        #[serde(rename = "work-count", default)]
        pub count: usize
    }

    #[derive(Debug, Deserialize)]
    pub struct Entity {
        pub id: String,
        pub name: Option<String>,
        pub title: Option<String>,
        #[serde(default)]
        pub disambiguation: String
    }

    #[derive(Debug, Deserialize)]
    pub struct RecordingReleases {
        #[serde(default)]
        pub releases: Vec<Release>
    }

    #[derive(Debug, Deserialize)]
    pub struct Release {
        #[serde(rename = "release-group")]
        pub release_group: Option<ReleaseGroup>
    }

    #[derive(Debug, Deserialize)]
    pub struct ReleaseGroup {
        #[serde(rename = "secondary-types", default)]
        pub secondary_types: Vec<String>
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

impl TryFrom<model::Work> for Work {
    type Error = LinkerError;

    fn try_from(w: model::Work) -> Result<Self, Self::Error> {
        Ok(Work::new(Mbid::parse(&w.id)?, w.title, non_empty(w.disambiguation)))
    }
}

impl TryFrom<model::Recording> for RemoteRecording {
    type Error = LinkerError;

    fn try_from(r: model::Recording) -> Result<Self, Self::Error> {
        let mut performances = Vec::new();
        for rel in r.relations.into_iter().filter(|rel| rel.kind == "performance") {
            let Some(work) = rel.work else { continue };
            let mut attributes = PerformanceAttributes::default();
            for attr in rel.attributes.iter().filter_map(|a| PerformanceAttribute::parse(a)) {
                attributes.set(attr, true);
            }
            performances.push(PerformanceLink {
                work: work.try_into()?,
                attributes,
                begin: rel.begin
            });
        }

        Ok(RemoteRecording {
            id: Mbid::parse(&r.id)?,
            title: r.title,
            comment: non_empty(r.disambiguation),
            performances
        })
    }
}

#[derive(Debug, Clone)]
pub struct MusicBrainzClient {
    http: Client,
    ws: Url,
    recordings_page_limit: u32
}

impl MusicBrainzClient {
    pub fn new(
        http_config: &HttpConfig,
        id: &IdentityConfig,
        cfg: &MusicBrainzConfig
    ) -> Result<Self, LinkerError> {
        let mut h = header::HeaderMap::new();
        h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let http = client_with_headers(http_config, h, &id.mb_user_agent)?;

        Ok( Self {
            http,
            ws: cfg.ws_url.clone(),
            recordings_page_limit: cfg.recordings_page_limit
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T, LinkerError> {
        debug!(url = %url, "lookup.get");
        let resp = check_status(self.http.get(url).send().await?).await?;
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl LookupService for MusicBrainzClient {
    /// GET /ws/2/recording?artist=..&inc=work-rels&limit=&offset=&fmt=json
    async fn fetch_recordings(&self, artist: &ArtistId, page: u32)
        -> Result<Vec<RemoteRecording>, LinkerError> {
        let limit = self.recordings_page_limit;
        let offset = page.saturating_sub(1) * limit;
        let mut url = join(&self.ws, "recording")?;
        url.set_query(Some(&format!(
            "artist={artist}&inc=work-rels&limit={limit}&offset={offset}&fmt=json"
        )));

        let list: model::RecordingList = self.get_json(url).await?;
        list.recordings.into_iter().map(RemoteRecording::try_from).collect()
    }

    /// GET /ws/2/work?artist=..&inc=aliases&limit=&offset=&fmt=json
    async fn fetch_works(&self, artist: &ArtistId, offset: u32, limit: u32)
        -> Result<WorkPage, LinkerError> {
        let mut url = join(&self.ws, "work")?;
        url.set_query(Some(&format!(
            "artist={artist}&inc=aliases&limit={limit}&offset={offset}&fmt=json"
        )));

        let list: model::WorkList = self.get_json(url).await?;
        let items = list.works.into_iter()
            .map(Work::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WorkPage { items, total_count: list.count })
    }

    /// GET /ws/2/{kind}/{mbid}?fmt=json
    async fn fetch_entity(&self, kind: EntityKind, id: &Mbid) -> Result<Entity, LinkerError> {
        let mut url = join(&self.ws, &format!("{}/{id}", kind.as_str()))?;
        url.set_query(Some("fmt=json"));

        let e: model::Entity = self.get_json(url).await?;
        let name = e.name.or(e.title)
            .ok_or_else(|| LinkerError::Parse(format!("{} {id} has no name", kind.as_str())))?;
        Ok(Entity {
            kind,
            id: Mbid::parse(&e.id)?,
            name,
            comment: non_empty(e.disambiguation)
        })
    }

    /// GET /ws/2/recording/{mbid}?inc=releases+release-groups&fmt=json
    async fn recording_is_live(&self, recording: &RecordingId) -> Result<bool, LinkerError> {
        let mut url = join(&self.ws, &format!("recording/{recording}"))?;
        url.set_query(Some("inc=releases+release-groups&fmt=json"));

        let found: model::RecordingReleases = self.get_json(url).await?;
        Ok(found.releases.iter()
            .filter_map(|r| r.release_group.as_ref())
            .any(|rg| rg.secondary_types.iter().any(|t| t == "Live")))
    }
}

/// Form fields of a relationship editor submission
pub fn performance_link_form(
    recording: &RecordingId,
    work: &WorkId,
    attributes: &PerformanceAttributes,
    period: Option<&Period>
) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = vec![
        ("rel-editor.rels.0.action".into(), "add".into()),
        ("rel-editor.rels.0.link_type".into(), PERFORMANCE_LINK_TYPE.into()),
        ("rel-editor.rels.0.entity.1.type".into(), "work".into()),
        ("rel-editor.rels.0.entity.1.gid".into(), work.to_string()),
        ("rel-editor.rels.0.entity.0.type".into(), "recording".into()),
        ("rel-editor.rels.0.entity.0.gid".into(), recording.to_string()),
    ];

    for (i, attr) in attributes.selected().into_iter().enumerate() {
        form.push((format!("rel-editor.rels.0.attributes.{i}.type.gid"), attr.type_gid().into()));
    }

    // a performance date is a single day, begin and end coincide
    if let Some(p) = period.filter(|p| !p.is_empty()) {
        let part = |v: Option<u32>| v.map(|v| v.to_string()).unwrap_or_default();
        for edge in ["begin_date", "end_date"] {
            form.push((format!("rel-editor.rels.0.period.{edge}.year"), part(p.year.map(u32::from))));
            form.push((format!("rel-editor.rels.0.period.{edge}.month"), part(p.month.map(u32::from))));
            form.push((format!("rel-editor.rels.0.period.{edge}.day"), part(p.day.map(u32::from))));
        }
    }
    form
}

pub fn create_work_form(title: &str, attributes: &WorkAttributes) -> Vec<(String, String)> {
    let mut form = vec![("edit-work.name".to_string(), title.to_string())];
    if let Some(t) = &attributes.type_id {
        form.push(("edit-work.type_id".into(), t.clone()));
    }
    if let Some(l) = &attributes.language_id {
        form.push(("edit-work.language_id".into(), l.clone()));
    }
    form
}

/// Without a session cookie every edit fails as a config error, lookups
/// still work
#[derive(Debug, Clone)]
pub struct MusicBrainzEditor {
    http: Client,
    site: Url,
    logged_in: bool
}

impl MusicBrainzEditor {
    pub fn new(
        http_config: &HttpConfig,
        id: &IdentityConfig,
        cfg: &MusicBrainzConfig
    ) -> Result<Self, LinkerError> {
        let mut h = header::HeaderMap::new();
        if let Some(cookie) = cfg.session_cookie.as_deref() {
            h.insert(
                header::COOKIE,
                header::HeaderValue::from_str(cookie)
                    .map_err(|e| LinkerError::Config(format!("invalid session cookie {e}")))?
            );
        }
        let http = client_with_headers(http_config, h, &id.mb_user_agent)?;

        Ok( Self {
            http,
            site: cfg.site_url.clone(),
            logged_in: cfg.session_cookie.is_some()
        })
    }

    fn ensure_logged_in(&self) -> Result<(), LinkerError> {
        if self.logged_in {
            Ok(())
        } else {
            Err(LinkerError::Config("MB_SESSION_COOKIE is required to edit".into()))
        }
    }
}

#[async_trait]
impl EditService for MusicBrainzEditor {
    /// POST /work/create, the new work's page is where the redirect lands
    async fn create_work(&self, title: &str, attributes: &WorkAttributes)
        -> Result<WorkId, LinkerError> {
        self.ensure_logged_in()?;
        let url = join(&self.site, "work/create")?;
        let resp = self.http.post(url)
            .form(&create_work_form(title, attributes))
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let landed = resp.url().to_string();
        if let Ok(id) = extract_mbid(&landed) {
            debug!(title, work = %id, "edit.work.created");
            return Ok(id);
        }
        let body = resp.text().await?;
        extract_mbid(&body)
            .map_err(|_| LinkerError::Parse(format!("no work id after creating {title:?}")))
    }

    /// POST /relationship-editor
    async fn submit_performance_link(
        &self,
        recording: &RecordingId,
        work: &WorkId,
        attributes: &PerformanceAttributes,
        period: Option<&Period>
    ) -> Result<(), LinkerError> {
        self.ensure_logged_in()?;
        let url = join(&self.site, "relationship-editor")?;
        let resp = self.http.post(url)
            .form(&performance_link_form(recording, work, attributes, period))
            .send()
            .await?;
        check_status(resp).await?;
        debug!(recording = %recording, work = %work, "edit.link.posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Mbid {
        Mbid::parse(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).unwrap()
    }

    fn field<'a>(form: &'a [(String, String)], key: &str) -> Option<&'a str> {
        form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn parses_recording_with_performance_relations() {
        let raw = r#"{
            "recordings": [{
                "id": "00000000-0000-4000-8000-000000000001",
                "title": "Song (live)",
                "disambiguation": "live, 1999-05-02: Berlin",
                "relations": [
                    { "type": "performance", "attributes": ["live", "partial"],
                      "begin": "1999-05-02",
                      "work": { "id": "00000000-0000-4000-8000-000000000002",
                                "title": "Song", "disambiguation": "" } },
                    { "type": "remix", "attributes": [] }
                ]
            }]
        }"#;
        let list: model::RecordingList = serde_json::from_str(raw).unwrap();
        let recs: Vec<RemoteRecording> = list.recordings.into_iter()
            .map(RemoteRecording::try_from)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.comment.as_deref(), Some("live, 1999-05-02: Berlin"));
        assert_eq!(rec.performances.len(), 1);
        let perf = &rec.performances[0];
        assert_eq!(perf.work.id, id(2));
        assert_eq!(perf.work.comment, None);
        assert!(perf.attributes.live && perf.attributes.partial && !perf.attributes.cover);
        assert_eq!(perf.begin.as_deref(), Some("1999-05-02"));
    }

    #[test]
    fn work_list_reads_total_count() {
        let raw = r#"{ "work-count": 120, "works": [
            { "id": "00000000-0000-4000-8000-000000000003", "title": "A", "disambiguation": "x" }
        ]}"#;
        let list: model::WorkList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.count, 120);
        let work = Work::try_from(list.works.into_iter().next().unwrap()).unwrap();
        assert_eq!(work.comment.as_deref(), Some("x"));
    }

    #[test]
    fn link_form_carries_attributes_and_date() {
        let attrs = PerformanceAttributes { live: true, cover: true, ..Default::default() };
        let period = Period::parse("1999-05").unwrap();
        let form = performance_link_form(&id(1), &id(2), &attrs, Some(&period));

        assert_eq!(field(&form, "rel-editor.rels.0.link_type"), Some("278"));
        assert_eq!(field(&form, "rel-editor.rels.0.entity.0.gid"), Some(id(1).as_str()));
        assert_eq!(field(&form, "rel-editor.rels.0.entity.1.gid"), Some(id(2).as_str()));
        assert_eq!(
            field(&form, "rel-editor.rels.0.attributes.0.type.gid"),
            Some(PerformanceAttribute::Live.type_gid())
        );
        assert_eq!(
            field(&form, "rel-editor.rels.0.attributes.1.type.gid"),
            Some(PerformanceAttribute::Cover.type_gid())
        );
        assert_eq!(field(&form, "rel-editor.rels.0.period.begin_date.year"), Some("1999"));
        assert_eq!(field(&form, "rel-editor.rels.0.period.end_date.month"), Some("5"));
        assert_eq!(field(&form, "rel-editor.rels.0.period.end_date.day"), Some(""));
    }

    #[test]
    fn link_form_without_period_has_no_dates() {
        let form = performance_link_form(&id(1), &id(2), &PerformanceAttributes::default(), None);
        assert!(form.iter().all(|(k, _)| !k.contains("period")));
        assert!(form.iter().all(|(k, _)| !k.contains("attributes")));
    }

    #[test]
    fn work_form_skips_unset_attributes() {
        let form = create_work_form("Song", &WorkAttributes {
            type_id: Some("17".into()),
            language_id: None
        });
        assert_eq!(field(&form, "edit-work.name"), Some("Song"));
        assert_eq!(field(&form, "edit-work.type_id"), Some("17"));
        assert_eq!(field(&form, "edit-work.language_id"), None);
    }
}
