//! Configuration surface for the Skald library.
//!
//! Tunables that are fixed at build time live in the `*Config` constant
//! structs. Everything the embedder may set between `open` and `run` goes
//! through the [`Config`] items accepted by `Skald::configure`.

use std::path::PathBuf;
use std::time::Duration;

/// Pipeline-level configuration.
pub struct PipelineConfig;

impl PipelineConfig {
    /// Default number of parser workers.
    pub const PARSER_THREADS_DEFAULT: usize = 2;
    /// Hard ceiling for parser workers.
    pub const PARSER_THREADS_MAX: usize = 8;
    /// Default number of grabber workers.
    pub const GRABBER_THREADS_DEFAULT: usize = 2;
    /// Hard ceiling for grabber workers.
    pub const GRABBER_THREADS_MAX: usize = 16;
    /// Row operations between two commits of the DB-Manager transaction.
    pub const COMMIT_INTERVAL_DEFAULT: u32 = 128;
}

/// Scanner configuration.
pub struct ScannerConfig;

impl ScannerConfig {
    /// Directory recursion ceiling; deeper trees are cut and logged.
    pub const RECURSION_MAX: usize = 42;
}

/// Grabber-pool configuration.
pub struct GrabberConfig;

impl GrabberConfig {
    /// Wait applied between lock attempts during the second selection pass.
    pub const LOCK_RETRY_WAIT: Duration = Duration::from_millis(200);
}

/// Network configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    pub const USER_AGENT: &'static str = concat!("skald/", env!("CARGO_PKG_VERSION"));
}

/// Destination kind for downloaded artwork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DlKind {
    Default = 0,
    Cover = 1,
    Thumbnail = 2,
    FanArt = 3,
}

impl DlKind {
    pub const COUNT: usize = 4;

    pub(crate) fn from_index(idx: i64) -> Option<Self> {
        match idx {
            0 => Some(DlKind::Default),
            1 => Some(DlKind::Cover),
            2 => Some(DlKind::Thumbnail),
            3 => Some(DlKind::FanArt),
            _ => None,
        }
    }
}

/// Metadata priority carried on every file/metadata association.
///
/// Lower values take precedence when an application resolves conflicting
/// values for the same key.
pub type MetaPriority = i8;

/// Named priority levels for [`MetaPriority`].
pub mod priority {
    use super::MetaPriority;

    pub const HIGHEST: MetaPriority = -128;
    pub const HIGHER: MetaPriority = -64;
    pub const HIGH: MetaPriority = -32;
    pub const NORMAL: MetaPriority = 0;
    pub const LOW: MetaPriority = 32;
    pub const LOWER: MetaPriority = 64;
    pub const LOWEST: MetaPriority = 127;
}

/// One configuration item, accepted by `Skald::configure` before `run`.
///
/// Each variant corresponds to one configuration key of the public surface.
#[derive(Debug, Clone)]
pub enum Config {
    /// Destination root for one kind of downloaded artwork.
    DownloaderDest { path: PathBuf, kind: DlKind },
    /// Change the default or per-key metadata priority for one grabber, or
    /// for all grabbers when `grabber` is `None`.
    GrabberPriority {
        grabber: Option<String>,
        priority: MetaPriority,
        meta: Option<String>,
    },
    /// Enable or disable one grabber.
    GrabberState { grabber: String, enabled: bool },
    /// Append a keyword to the decrapifier blacklist.
    ParserKeyword(String),
    /// Add a scan root.
    ScannerPath { path: PathBuf, recursive: bool },
    /// Add an accepted file extension (matched case-insensitively).
    ScannerSuffix(String),
}

/// Parameters for one `run` call.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of scan loops; zero or negative means loop forever.
    pub loops: i32,
    /// Sleep between two loops. `None` disables the inter-loop sleep.
    pub timeout: Option<Duration>,
    /// Delay applied before the first loop starts.
    pub delay: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            loops: 1,
            timeout: None,
            delay: None,
        }
    }
}

/// Options for opening a library handle.
#[derive(Debug, Clone)]
pub struct LibraryOptions {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Number of parser workers (clamped to `PARSER_THREADS_MAX`).
    pub parser_threads: usize,
    /// Number of grabber workers (clamped to `GRABBER_THREADS_MAX`).
    pub grabber_threads: usize,
    /// Enable the filename decrapifier.
    pub decrapifier: bool,
    /// Row operations between two commits; `0` selects the default.
    pub commit_interval: u32,
    /// Publish the on-demand event key list for `ondemand_meta_keys`.
    pub od_meta: bool,
}

impl LibraryOptions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            parser_threads: PipelineConfig::PARSER_THREADS_DEFAULT,
            grabber_threads: PipelineConfig::GRABBER_THREADS_DEFAULT,
            decrapifier: false,
            commit_interval: PipelineConfig::COMMIT_INTERVAL_DEFAULT,
            od_meta: false,
        }
    }
}
