//!
//! src/config.rs  Andrew Belles  Oct 16th, 2026
//!
//! Environment driven configuration for the linker. Values are read once
//! at startup (after .env is loaded) and validated into typed structs.
//!

use std::str::FromStr;
use std::time;

use url::Url;

use crate::errors::LinkerError;
use crate::scheduler::TaskKind;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 8000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

/// Constants for the shared request budget
pub const RATE_BURST_THRESHOLD: u32 = 10;
pub const RATE_PENALTY_MS: u64 = 1000;
pub const RATE_DECAY_MS: u64 = 1000;

/// Constants for matching
pub const MATCH_THRESHOLD: f64 = 0.250001;
pub const MATCH_PROGRESS_EVERY: usize = 12;

pub const WORKS_PAGE_LIMIT: u32 = 50;
pub const RECORDINGS_PAGE_LIMIT: u32 = 50;
pub const CACHE_FLUSH_BATCH: usize = 25;

/// Wrapper over env::var to return an invalid environment var error
fn env_check(s: &str) -> Result<String, LinkerError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(LinkerError::Config(format!("{s} was not set"))),
    }
}

fn env_optional(s: &str) -> Option<String> {
    std::env::var(s).ok().filter(|v| !v.trim().is_empty())
}

/// Parses an env var, falling back to `default` when unset or malformed
fn env_parse<T: FromStr>(s: &str, default: T) -> T {
    std::env::var(s)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(s: &str, default: u64) -> time::Duration {
    time::Duration::from_millis(env_parse(s, default))
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) if h.to_ascii_lowercase().ends_with(&format!(".{expected_host}")) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
}

/// Identity expected by musicbrainz in the user agent
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub mb_user_agent: String,
}

fn build_identity() -> Result<IdentityConfig, LinkerError> {
    let application   = env_check("APPLICATION")?;
    let header        = env_check("MUSIC_BRAINZ_HEADER")?;
    let mb_user_agent = format!("{application} {header}");

    Ok( IdentityConfig { mb_user_agent } )
}

///
/// Configuration for musicbrainz web service and editor
///
#[derive(Debug, Clone)]
pub struct MusicBrainzConfig {
    pub site_url: Url,              // https://musicbrainz.org/
    pub ws_url: Url,                // {site}/ws/2/
    pub session_cookie: Option<String>,
    pub works_page_limit: u32,      // default 50
    pub recordings_page_limit: u32  // default 50
}

fn build_musicbrainz() -> Result<MusicBrainzConfig, LinkerError> {
    let site_url = std::env::var("MB_BASE_URL")
        .unwrap_or_else(|_| "https://musicbrainz.org/".to_string());

    let mut site_url = Url::parse(&site_url)
        .map_err(|e| LinkerError::Config(
                format!("MB_BASE_URL invalid {e}")
        ))?;

    // https and hostname check
    ensure_https(&site_url)
        .map_err(LinkerError::Config)?;
    ensure_host(&site_url, "musicbrainz.org")
        .map_err(LinkerError::Config)?;
    ensure_trailing_slash(&mut site_url);

    let ws_url = site_url.join("ws/2/")
        .map_err(|e| LinkerError::Config(format!("ws url invalid {e}")))?;

    Ok( MusicBrainzConfig {
        site_url,
        ws_url,
        session_cookie: env_optional("MB_SESSION_COOKIE"),
        works_page_limit: env_parse("MB_WORKS_PAGE_LIMIT", WORKS_PAGE_LIMIT),
        recordings_page_limit: env_parse("MB_RECORDINGS_PAGE_LIMIT", RECORDINGS_PAGE_LIMIT),
    })
}

///
/// Configuration for Http timeouts, pools, etc.
///
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
        }
    }
}

///
/// Configuration for the shared rate window
///
#[derive(Debug, Clone)]
pub struct RateConfig {
    pub burst_threshold: u32,         // load at which extra delay starts
    pub penalty: time::Duration,      // extra delay per unit over budget
    pub decay_interval: time::Duration // one unit drained per interval
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            burst_threshold: RATE_BURST_THRESHOLD,
            penalty: time::Duration::from_millis(RATE_PENALTY_MS),
            decay_interval: time::Duration::from_millis(RATE_DECAY_MS),
        }
    }
}

fn build_rate() -> RateConfig {
    RateConfig {
        burst_threshold: env_parse("RATE_BURST_THRESHOLD", RATE_BURST_THRESHOLD).max(1),
        penalty: env_millis("RATE_PENALTY_MS", RATE_PENALTY_MS),
        decay_interval: env_millis("RATE_DECAY_MS", RATE_DECAY_MS),
    }
}

///
/// Cadence and weight of one scheduler
///
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub base_interval: time::Duration,
    pub weight: u32
}

impl LaneConfig {
    pub fn for_kind(kind: TaskKind) -> Self {
        Self { base_interval: kind.base_interval(), weight: kind.weight() }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lookup: LaneConfig,
    pub submission: LaneConfig
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookup: LaneConfig::for_kind(TaskKind::Lookup),
            submission: LaneConfig::for_kind(TaskKind::Submission),
        }
    }
}

fn build_scheduler() -> SchedulerConfig {
    let defaults = SchedulerConfig::default();
    SchedulerConfig {
        lookup: LaneConfig {
            base_interval: env_millis(
                "LOOKUP_INTERVAL_MS", defaults.lookup.base_interval.as_millis() as u64),
            weight: env_parse("LOOKUP_WEIGHT", defaults.lookup.weight),
        },
        submission: LaneConfig {
            base_interval: env_millis(
                "EDIT_INTERVAL_MS", defaults.submission.base_interval.as_millis() as u64),
            weight: env_parse("EDIT_WEIGHT", defaults.submission.weight),
        },
    }
}

///
/// Configuration for fuzzy matching of recordings against works
///
#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    pub threshold: f64,       // scores at or above are never suggested
    pub progress_every: usize // candidates between progress updates
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { threshold: MATCH_THRESHOLD, progress_every: MATCH_PROGRESS_EVERY }
    }
}

///
/// Configuration for the persisted work cache
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub flush_batch: usize
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/work-linker.db".to_string(),
            flush_batch: CACHE_FLUSH_BATCH
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    let defaults = PersistenceConfig::default();
    PersistenceConfig {
        db_url: std::env::var("LINKER_DB_URL").unwrap_or(defaults.db_url),
        flush_batch: env_parse("CACHE_FLUSH_BATCH", defaults.flush_batch).max(1),
    }
}

///
/// Attributes given to works created by the linker
///
#[derive(Debug, Clone, Default)]
pub struct WorkOptionsConfig {
    pub type_id: Option<String>,
    pub language_id: Option<String>
}

fn build_work_options() -> WorkOptionsConfig {
    WorkOptionsConfig {
        type_id: env_optional("WORK_TYPE_ID"),
        language_id: env_optional("WORK_LANGUAGE_ID"),
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

impl FromStr for LogFormat {
    type Err = LinkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json"   => Ok(LogFormat::Json),
            other    => Err(LinkerError::Config(format!("unknown log format {other}")))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,work_linker=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: false,
            include_file_line: true,
            include_target: true,
        }
    }
}

fn build_logging() -> Result<LoggingConfig, LinkerError> {
    let mut logging = LoggingConfig::default();
    if let Some(format) = env_optional("LOG_FORMAT") {
        logging.format = format.parse()?;
    }
    logging.with_ansi = logging.format == LogFormat::Pretty;
    Ok(logging)
}

///
/// The artist whose recordings are being linked
///
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub artist_mbid: String,
    pub artist_name: String,
    pub page: u32,
    pub link_suggested: bool
}

fn build_target() -> Result<TargetConfig, LinkerError> {
    Ok(TargetConfig {
        artist_mbid: env_check("ARTIST_MBID")?,
        artist_name: env_optional("ARTIST_NAME").unwrap_or_default(),
        page: env_parse("RECORDINGS_PAGE", 1_u32).max(1),
        link_suggested: env_parse("LINK_SUGGESTED", false),
    })
}

///
/// AppConfig which holds everything the linker needs
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub musicbrainz: MusicBrainzConfig,
    pub http: HttpConfig,
    pub rate: RateConfig,
    pub scheduler: SchedulerConfig,
    pub matching: MatchConfig,
    pub persistence: PersistenceConfig,
    pub work_options: WorkOptionsConfig,
    pub logging: LoggingConfig,
    pub target: TargetConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, LinkerError> {
    dotenvy::dotenv().ok();

    let identity     = build_identity()?;
    let musicbrainz  = build_musicbrainz()?;
    let http         = HttpConfig::default();
    let rate         = build_rate();
    let scheduler    = build_scheduler();
    let matching     = MatchConfig {
        threshold: env_parse("MATCH_THRESHOLD", MATCH_THRESHOLD),
        progress_every: env_parse("MATCH_PROGRESS_EVERY", MATCH_PROGRESS_EVERY).max(1),
    };
    let persistence  = build_persistence();
    let work_options = build_work_options();
    let logging      = build_logging()?;
    let target       = build_target()?;

    Ok( AppConfig {
        identity, musicbrainz, http, rate, scheduler, matching,
        persistence, work_options, logging, target
    } )
}
