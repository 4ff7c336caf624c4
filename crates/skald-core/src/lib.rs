//! Skald - headless media-library indexer.
//!
//! Skald walks configured filesystem roots, parses media files for embedded
//! metadata, optionally enriches each file through metadata grabbers and
//! downloads associated artwork, and persists the resulting graph into a
//! single-file SQLite store so applications can query by attribute (artist,
//! album, genre, date, ...).
//!
//! The pipeline runs on plain OS threads:
//! scanner -> DB-manager -> dispatcher -> parser -> grabbers -> downloader,
//! with the DB-manager as the single writer to the store. Files can also be
//! injected (or priority-elevated) one at a time through the on-demand
//! interface.
//!
//! # Example
//!
//! ```rust,no_run
//! use skald_library::{Callbacks, Config, LibraryOptions, RunOptions, Skald};
//!
//! fn main() -> skald_library::Result<()> {
//!     let skald = Skald::open(LibraryOptions::new("/var/lib/skald/library.db"), Callbacks::default())?;
//!     skald.configure(Config::ScannerPath { path: "/media/music".into(), recursive: true })?;
//!     skald.configure(Config::ScannerSuffix("mp3".into()))?;
//!     skald.configure(Config::ScannerSuffix("flac".into()))?;
//!
//!     skald.run(RunOptions::default())?;
//!     skald.wait();
//!
//!     for file in skald.filelist(None, &[])? {
//!         println!("{} ({:?})", file.path.display(), file.file_type);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod db;
pub mod dbmanager;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod event;
pub mod fifo;
pub mod filedata;
pub mod grabber;
pub mod meta;
pub mod net;
pub mod ondemand;
pub mod parser;
pub mod scanner;
pub mod stats;
pub mod sync;

// Re-export commonly used types
pub use config::{priority, Config, DlKind, LibraryOptions, MetaPriority, RunOptions};
pub use db::{FileMetaRow, FileRef, FileRes, MetaRes, Restriction, RestrictOp, SearchSpec};
pub use error::{Result, SkaldError};
pub use event::{Callbacks, GlEvent, MdEvent, OdEvent};
pub use filedata::{FileData, FileInfo, FileType};
pub use grabber::{Caps, DummyGrabber, Grabber, GrabberParams, LocalGrabber, TmdbGrabber};
pub use meta::{Lang, MetaEntry, MetaGroup, MetaList, PriorityList};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::db::Database;
use crate::dbmanager::DbManager;
use crate::dispatcher::{Dispatcher, Targets};
use crate::downloader::Downloader;
use crate::event::EventHandler;
use crate::fifo::Band;
use crate::filedata::{Action, ExtMetaOp, Step};
use crate::grabber::GrabberPool;
use crate::net::HttpClient;
use crate::ondemand::{OdContext, OnDemand};
use crate::parser::Parser;
use crate::scanner::Scanner;
use crate::stats::Stats;

/// The library handle: owns every pipeline stage and the store.
///
/// Configuration happens between [`Skald::open`] and [`Skald::run`];
/// [`Skald::wait`] joins the scanner and drains the pipeline cleanly, while
/// dropping the handle forces everything down and persists pending download
/// contexts for the next run.
pub struct Skald {
    db: Database,
    stats: Arc<Stats>,
    events: Arc<EventHandler>,
    scanner: Arc<Scanner>,
    dispatcher: Arc<Dispatcher>,
    parser: Arc<Parser>,
    grabber: Arc<GrabberPool>,
    downloader: Arc<Downloader>,
    dbmanager: Arc<DbManager>,
    ondemand: Arc<OnDemand>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Skald {
    /// Open the store and build the (stopped) pipeline.
    pub fn open(opts: LibraryOptions, callbacks: Callbacks) -> Result<Self> {
        let db = Database::open(&opts.db_path)?;
        let stats = Arc::new(Stats::new());
        let cancel = CancellationToken::new();
        let http = Arc::new(HttpClient::new()?);

        let events = Arc::new(EventHandler::new(callbacks, opts.od_meta));
        let scanner = Arc::new(Scanner::new(cancel.clone()));
        let dispatcher = Arc::new(Dispatcher::new(cancel.clone()));
        let parser = Arc::new(Parser::new(
            opts.parser_threads,
            opts.decrapifier,
            cancel.clone(),
        ));
        let grabber = Arc::new(GrabberPool::new(
            opts.grabber_threads,
            Arc::clone(&stats),
            Arc::clone(&http),
            cancel.clone(),
        ));
        let downloader = Arc::new(Downloader::new(Arc::clone(&http), cancel.clone()));
        let commit_interval = if opts.commit_interval == 0 {
            config::PipelineConfig::COMMIT_INTERVAL_DEFAULT
        } else {
            opts.commit_interval
        };
        let dbmanager = Arc::new(DbManager::new(db.clone(), commit_interval, cancel.clone()));
        let ondemand = Arc::new(OnDemand::new(Arc::clone(&stats), cancel.clone()));

        grabber.register(Box::new(DummyGrabber::new()));
        grabber.register(Box::new(LocalGrabber::new()));

        Ok(Self {
            db,
            stats,
            events,
            scanner,
            dispatcher,
            parser,
            grabber,
            downloader,
            dbmanager,
            ondemand,
            cancel,
            running: AtomicBool::new(false),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply one configuration item. Scanner, parser and downloader settings
    /// are only accepted before `run`; grabber state and priorities may be
    /// adjusted at any time.
    pub fn configure(&self, item: Config) -> Result<()> {
        match item {
            Config::GrabberState { grabber, enabled } => {
                self.grabber.state_set(&grabber, enabled);
                return Ok(());
            }
            Config::GrabberPriority {
                grabber,
                priority,
                meta,
            } => {
                self.grabber
                    .priority_set(grabber.as_deref(), meta.as_deref(), priority);
                return Ok(());
            }
            _ => {}
        }

        if self.is_running() {
            return Err(SkaldError::config("configuration is frozen while running"));
        }

        match item {
            Config::DownloaderDest { path, kind } => self.downloader.destination_set(kind, path),
            Config::ParserKeyword(keyword) => self.parser.keyword_add(&keyword),
            Config::ScannerPath { path, recursive } => self.scanner.path_add(path, recursive),
            Config::ScannerSuffix(suffix) => self.scanner.suffix_add(suffix),
            Config::GrabberState { .. } | Config::GrabberPriority { .. } => unreachable!(),
        }
        Ok(())
    }

    /// Register an additional grabber plugin; only possible before `run`.
    pub fn register_grabber(&self, grabber: Box<dyn Grabber>) -> Result<()> {
        if self.is_running() {
            return Err(SkaldError::config("grabbers must be registered before run"));
        }
        self.grabber.register(grabber);
        Ok(())
    }

    /// Names of all registered grabbers.
    pub fn grabber_names(&self) -> Vec<&'static str> {
        self.grabber.grabber_names()
    }

    /// Start every stage and kick off the scan loops.
    pub fn run(&self, opts: RunOptions) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SkaldError::AlreadyRunning);
        }
        self.cancel.reset();

        self.events.run()?;
        self.scanner
            .run(&opts, self.dbmanager.fifo(), Arc::clone(&self.events))?;
        self.dbmanager.run(
            self.dispatcher.fifo(),
            Arc::clone(&self.scanner),
            Arc::clone(&self.events),
        )?;
        self.dispatcher.run(Targets {
            db: self.dbmanager.fifo(),
            parser: self.parser.fifo(),
            grabber: self.grabber.fifo(),
            downloader: self.downloader.fifo(),
        })?;
        self.parser.run(self.dispatcher.fifo())?;
        self.grabber.run(self.dispatcher.fifo())?;
        self.downloader.run(self.dispatcher.fifo())?;
        self.ondemand.run(OdContext {
            grabber: Arc::clone(&self.grabber),
            downloader: Arc::clone(&self.downloader),
            parser: Arc::clone(&self.parser),
            dispatcher: Arc::clone(&self.dispatcher),
            dbmanager: Arc::clone(&self.dbmanager),
            scanner: Arc::clone(&self.scanner),
            db: self.db.clone(),
            events: Arc::clone(&self.events),
        })?;
        Ok(())
    }

    /// Join the scanner, then shut the stages down in pipeline order so every
    /// in-flight file drains.
    pub fn wait(&self) {
        if !self.is_running() {
            return;
        }
        self.scanner.wait();

        self.dbmanager.stop();
        self.dispatcher.stop();
        self.parser.stop();
        self.grabber.stop();
        self.downloader.stop();
        self.ondemand.stop();
        self.events.stop();

        self.drain_queues();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Force every stage down immediately. Pending download contexts are
    /// persisted so the next run resumes them.
    pub fn shutdown(&self) {
        if !self.is_running() {
            return;
        }
        self.cancel.cancel();

        self.scanner.stop();
        self.dbmanager.stop();
        self.dispatcher.stop();
        self.parser.stop();
        self.grabber.stop();
        self.downloader.stop();
        self.ondemand.stop();
        self.events.stop();

        self.drain_queues();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drain every queue once the stages are joined. A record may sit in
    /// several queues at once; deduplicate on the allocation so each is
    /// handled exactly once.
    fn drain_queues(&self) {
        if let Err(e) = self.db.dlcontext_delete_all() {
            warn!("database operation failed: {e}");
        }

        let queues = [
            self.dbmanager.fifo(),
            self.dispatcher.fifo(),
            self.parser.fifo(),
            self.grabber.fifo(),
            self.downloader.fifo(),
        ];

        let mut seen = HashSet::new();
        let mut leaked = 0usize;
        for queue in &queues {
            while let Some(action) = queue.try_pop() {
                let Some(data) = action.file() else { continue };
                if !seen.insert(Arc::as_ptr(data) as usize) {
                    continue;
                }
                leaked += 1;
                if data.step() < Step::Ending && data.has_downloads() {
                    if let Err(e) = self.db.dlcontext_save(data.path(), &data.downloads()) {
                        warn!("database operation failed: {e}");
                    }
                }
            }
        }
        if leaked > 0 {
            debug!(leaked, "drained in-flight records");
        }
    }

    /* On-demand */

    /// Ask for one path to be indexed (or elevated) ahead of everything else.
    pub fn ondemand(&self, path: impl Into<PathBuf>) -> Result<()> {
        if !self.is_running() {
            return Err(SkaldError::config("on-demand requires a running pipeline"));
        }
        self.ondemand.engage(path.into());
        Ok(())
    }

    /// Metadata keys of the on-demand event currently being delivered; only
    /// meaningful inside the on-demand callback.
    pub fn ondemand_meta_keys(&self) -> Option<Vec<String>> {
        self.events.od_meta_keys()
    }

    /// Interrupt the scanner's inter-loop sleep.
    pub fn scanner_wakeup(&self) {
        self.scanner.wakeup();
    }

    /* Queries */

    pub fn metalist(
        &self,
        search: &SearchSpec,
        filetype: Option<FileType>,
        restrictions: &[Restriction],
    ) -> Result<Vec<MetaRes>> {
        self.db.metalist(search, filetype, restrictions)
    }

    pub fn filelist(
        &self,
        filetype: Option<FileType>,
        restrictions: &[Restriction],
    ) -> Result<Vec<FileRes>> {
        self.db.filelist(filetype, restrictions)
    }

    pub fn file_get(
        &self,
        target: impl Into<FileRef>,
        restrictions: &[Restriction],
    ) -> Result<Vec<FileMetaRow>> {
        self.db.file_get(target.into(), restrictions)
    }

    /* External metadata */

    fn ext_meta(&self, op: ExtMetaOp) -> Result<()> {
        if self.is_running() {
            // Keep all writes on the DB-Manager thread.
            self.dbmanager.send(Band::High, Action::ExtMeta(op));
            Ok(())
        } else {
            dbmanager::apply_ext_meta(&self.db, op)
        }
    }

    /// Attach a metadata pair to a file. The association is marked external:
    /// the pipeline will never overwrite or delete it.
    pub fn metadata_insert(
        &self,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        value: impl Into<String>,
        lang: Lang,
        group: MetaGroup,
    ) -> Result<()> {
        self.ext_meta(ExtMetaOp::Insert {
            path: path.into(),
            name: name.into(),
            value: value.into(),
            lang,
            group,
        })
    }

    /// Replace the value of an external association.
    pub fn metadata_update(
        &self,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
        lang: Lang,
    ) -> Result<()> {
        self.ext_meta(ExtMetaOp::Update {
            path: path.into(),
            name: name.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            lang,
        })
    }

    /// Delete one association (external or not).
    pub fn metadata_delete(
        &self,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.ext_meta(ExtMetaOp::Delete {
            path: path.into(),
            name: name.into(),
            value: value.into(),
        })
    }

    /// Update association priorities for a whole file, one key, or one
    /// key/value pair.
    pub fn metadata_priority(
        &self,
        path: impl Into<PathBuf>,
        name: Option<String>,
        value: Option<String>,
        priority: MetaPriority,
    ) -> Result<()> {
        self.ext_meta(ExtMetaOp::Priority {
            path: path.into(),
            name,
            value,
            priority,
        })
    }

    /* Statistics */

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Log the dump of every statistics group.
    pub fn stats_dump(&self) {
        self.stats.dump(None);
    }

    /// Direct read access to the store, for embedders needing more than the
    /// query surface.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl Drop for Skald {
    fn drop(&mut self) {
        self.shutdown();
        self.grabber.uninit_plugins();
    }
}
