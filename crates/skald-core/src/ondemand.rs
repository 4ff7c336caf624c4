//! On-demand worker.
//!
//! An engage request either elevates a file already travelling through the
//! pipeline to the high band everywhere, or fast-path-ingests a file the
//! scanner has not seen (possibly outside every configured root). Both paths
//! need a stable view of the stage queues, obtained by pausing all five
//! stages behind their gates.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::db::Database;
use crate::dbmanager::DbManager;
use crate::dispatcher::Dispatcher;
use crate::downloader::Downloader;
use crate::error::{Result, SkaldError};
use crate::event::{EventHandler, OdEvent};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, DbWrite, FileData, OdKind, Step};
use crate::grabber::GrabberPool;
use crate::parser::Parser;
use crate::scanner::Scanner;
use crate::stats::Stats;

const STATS_GROUP: &str = "ondemand";

#[derive(Debug)]
pub enum OdMsg {
    Engage(PathBuf),
    Kill,
}

/// Collaborators the worker drives. The pause order is load-bearing: the
/// grabber may be gated on the DB-Manager, so the grabber pauses first and
/// the DB-Manager last.
#[derive(Clone)]
pub struct OdContext {
    pub grabber: Arc<GrabberPool>,
    pub downloader: Arc<Downloader>,
    pub parser: Arc<Parser>,
    pub dispatcher: Arc<Dispatcher>,
    pub dbmanager: Arc<DbManager>,
    pub scanner: Arc<Scanner>,
    pub db: Database,
    pub events: Arc<EventHandler>,
}

impl OdContext {
    fn pause_all(&self) {
        self.grabber.pause_toggle();
        self.downloader.pause_toggle();
        self.parser.pause_toggle();
        self.dispatcher.pause_toggle();
        self.dbmanager.pause_toggle();
    }

    fn resume_all(&self) {
        self.grabber.pause_toggle();
        self.downloader.pause_toggle();
        self.parser.pause_toggle();
        self.dispatcher.pause_toggle();
        self.dbmanager.pause_toggle();
    }

    fn queues(&self) -> [Arc<Fifo<Action>>; 5] {
        [
            self.grabber.fifo(),
            self.downloader.fifo(),
            self.parser.fifo(),
            self.dispatcher.fifo(),
            self.dbmanager.fifo(),
        ]
    }
}

pub struct OnDemand {
    fifo: Arc<Fifo<OdMsg>>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OnDemand {
    pub fn new(stats: Arc<Stats>, cancel: CancellationToken) -> Self {
        let queries = stats.counter(STATS_GROUP, STATS_GROUP, None);
        let timer = stats.timer(STATS_GROUP, STATS_GROUP, None);
        let dump_queries = Arc::clone(&queries);
        let dump_timer = Arc::clone(&timer);
        stats.group_add(
            STATS_GROUP,
            Some(Box::new(move || {
                let total = dump_queries.read();
                let time = dump_timer.read_secs();
                info!(
                    "statistics dump ({STATS_GROUP}): {total} queries, {time:.2} sec, {:.2} sec/file",
                    if total > 0 { time / total as f64 } else { 0.0 }
                );
            })),
        );

        Self {
            fifo: Arc::new(Fifo::new()),
            cancel,
            stats,
            thread: Mutex::new(None),
        }
    }

    /// Queue an engage request for `path`.
    pub fn engage(&self, path: PathBuf) {
        self.fifo.push(Band::Normal, OdMsg::Engage(path));
    }

    pub fn run(&self, ctx: OdContext) -> Result<()> {
        let worker = Worker {
            fifo: Arc::clone(&self.fifo),
            cancel: self.cancel.clone(),
            queries: self.stats.counter(STATS_GROUP, STATS_GROUP, None),
            timer: self.stats.timer(STATS_GROUP, STATS_GROUP, None),
            ctx,
        };

        let handle = std::thread::Builder::new()
            .name("skald-ondemand".into())
            .spawn(move || worker.run())
            .map_err(|e| SkaldError::Thread(e.to_string()))?;

        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let handle = {
            let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            self.fifo.push(Band::High, OdMsg::Kill);
            if handle.join().is_err() {
                warn!("ondemand thread panicked");
            }
        }
    }
}

struct Worker {
    fifo: Arc<Fifo<OdMsg>>,
    cancel: CancellationToken,
    queries: Arc<crate::stats::Counter>,
    timer: Arc<crate::stats::Timer>,
    ctx: OdContext,
}

impl Worker {
    fn run(self) {
        loop {
            match self.fifo.pop() {
                OdMsg::Kill => break,
                OdMsg::Engage(path) => self.engage(path),
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        debug!("ondemand stopped");
    }

    fn engage(&self, path: PathBuf) {
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), "file unavailable: {e}");
                return;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        // Already fully indexed at this mtime: report and stop.
        match self.ctx.db.file_complete(&path, mtime) {
            Ok(true) => {
                self.ctx.events.send_od(&path, OdEvent::Ended, None, None);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("database operation failed: {e}"),
        }

        self.queries.inc();
        self.timer.start();

        // With every stage quiescent the queues cannot move under us.
        self.ctx.pause_all();

        let queues = self.ctx.queues();
        let found = queues.iter().find_map(|queue| {
            queue.search(|action| match action {
                Action::NewFile(data) if data.path() == path => {
                    Some((Arc::clone(data), false))
                }
                Action::Db(write, data) if data.path() == path => {
                    Some((Arc::clone(data), *write == DbWrite::End))
                }
                _ => None,
            })
        });

        match found {
            Some((data, ended)) => {
                debug!(path = %path.display(), ended, "already in flight, elevating");
                if !ended {
                    data.set_band(Band::High);
                    for queue in &queues {
                        queue.promote(|action| action.matches_pending(&path));
                    }
                }
                if data.od() == OdKind::Scan {
                    data.set_od(OdKind::Elevated);
                }
            }
            None if meta.is_file() && self.ctx.scanner.suffix_matches(&path) => {
                let outofpath = !self.ctx.scanner.path_contains(&path);
                debug!(path = %path.display(), outofpath, "fast-path ingestion");
                let data = FileData::new(
                    &path,
                    mtime,
                    meta.len(),
                    outofpath,
                    OdKind::New,
                    Band::High,
                    Step::Parsing,
                );
                self.ctx.dbmanager.send(Band::High, Action::NewFile(data));
            }
            None => {
                warn!(path = %path.display(), "file unsupported");
            }
        }

        self.ctx.resume_all();
        self.timer.stop();
    }
}
