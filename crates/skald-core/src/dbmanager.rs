//! DB-Manager: the single thread owning every write to the store.
//!
//! It consumes the actions of one scan loop inside a batched transaction,
//! then closes the loop out with the reconciliation sweep: unobserved files
//! are validated against the configured roots and suffixes, dead rows and
//! orphans are collected, and in-flight markers are rewritten so an
//! interrupted loop recovers on the next run.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::db::Database;
use crate::error::{Result, SkaldError};
use crate::event::{EventHandler, MdEvent, OdEvent};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, DbWrite, ExtMetaOp, FileData, OdKind};
use crate::scanner::{ScanMsg, Scanner};
use crate::sync::PauseGate;

#[derive(Debug, Default)]
struct LoopStats {
    file_insert: u32,
    file_update: u32,
    file_nochange: u32,
    grab_insert: u32,
    grab_update: u32,
    ext_ops: u32,
}

impl LoopStats {
    fn row_ops(&self) -> u32 {
        self.file_insert + self.file_update + self.grab_insert + self.grab_update + self.ext_ops
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    NextLoop,
    Kill,
}

pub struct DbManager {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    db: Database,
    commit_interval: u32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DbManager {
    pub fn new(db: Database, commit_interval: u32, cancel: CancellationToken) -> Self {
        Self {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel,
            db,
            commit_interval,
            thread: Mutex::new(None),
        }
    }

    pub fn fifo(&self) -> Arc<Fifo<Action>> {
        Arc::clone(&self.fifo)
    }

    pub fn send(&self, band: Band, action: Action) {
        self.fifo.push(band, action);
    }

    pub fn pause_toggle(&self) {
        let fifo = Arc::clone(&self.fifo);
        self.gate
            .toggle(1, move || fifo.push(Band::High, Action::Pause));
    }

    pub fn run(
        &self,
        dispatcher: Arc<Fifo<Action>>,
        scanner: Arc<Scanner>,
        events: Arc<EventHandler>,
    ) -> Result<()> {
        let worker = Worker {
            fifo: Arc::clone(&self.fifo),
            gate: Arc::clone(&self.gate),
            cancel: self.cancel.clone(),
            db: self.db.clone(),
            commit_interval: self.commit_interval,
            dispatcher,
            scanner,
            events,
        };

        let handle = std::thread::Builder::new()
            .name("skald-dbmanager".into())
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
            self.fifo.push(Band::High, Action::Kill);
            self.gate.force_resume(1);
            if handle.join().is_err() {
                warn!("dbmanager thread panicked");
            }
        }
    }
}

struct Worker {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    db: Database,
    commit_interval: u32,
    dispatcher: Arc<Fifo<Action>>,
    scanner: Arc<Scanner>,
    events: Arc<EventHandler>,
}

/// Runtime storage errors are absorbed: log, skip the row, keep going.
macro_rules! db_try {
    ($expr:expr) => {
        if let Err(e) = $expr {
            warn!("database operation failed: {e}");
        }
    };
}

impl Worker {
    fn run(self) {
        loop {
            let mut stats = LoopStats::default();

            db_try!(self.db.checked_clear_all());

            db_try!(self.db.begin_transaction());
            let outcome = self.drain_queue(&mut stats);
            db_try!(self.db.end_transaction());

            let deleted = self.sweep(&stats);

            info!(
                inserted = stats.file_insert,
                updated = stats.file_update,
                deleted,
                unchanged = stats.file_nochange,
                "scan loop closed"
            );

            if outcome == Outcome::Kill {
                break;
            }
        }
        debug!("dbmanager stopped");
    }

    fn drain_queue(&self, stats: &mut LoopStats) -> Outcome {
        loop {
            let action = self.fifo.pop();

            match action {
                Action::Kill => return Outcome::Kill,

                Action::NextLoop => {
                    self.dispatcher.push(Band::Normal, Action::NextLoop);
                    return Outcome::NextLoop;
                }

                Action::Pause => {
                    self.gate.worker_pause();
                    if self.cancel.is_cancelled() {
                        return Outcome::Kill;
                    }
                    continue;
                }

                action => {
                    db_try!(self
                        .db
                        .step_transaction(self.commit_interval, stats.row_ops()));
                    self.handle_action(action, stats);
                }
            }

            if self.cancel.is_cancelled() {
                return Outcome::Kill;
            }
        }
    }

    fn handle_action(&self, action: Action, stats: &mut LoopStats) {
        match action {
            Action::NewFile(data) => self.on_new_file(data, stats),

            Action::Db(write @ (DbWrite::InsertParser | DbWrite::UpdateParser), data) => {
                db_try!(self.db.file_parser_write(&data));
                if data.od() != OdKind::Scan {
                    let keys = data.meta_parser().key_names();
                    self.events
                        .send_od(data.path(), OdEvent::Parsed, None, Some(keys));
                }
                let meta = data.meta_parser().clone();
                self.events
                    .send_md(MdEvent::ParserMeta, None, data.info(), meta);
                if write == DbWrite::UpdateParser {
                    stats.file_update += 1;
                }
                // The record is still travelling; no ack yet.
            }

            Action::Db(write @ (DbWrite::InsertGrabber | DbWrite::UpdateGrabber), data) => {
                let meta = data.take_meta_grabber();
                let grabber = data.grabber_name();
                db_try!(self.db.file_grab_write(data.path(), &meta, grabber));
                if data.od() != OdKind::Scan {
                    self.events.send_od(
                        data.path(),
                        OdEvent::Grabbed,
                        grabber,
                        Some(meta.key_names()),
                    );
                }
                self.events
                    .send_md(MdEvent::GrabberMeta, grabber, data.info(), meta);
                // The grabber metadata is in the store; the next grabber for
                // this file may proceed.
                if data.wait_flag() {
                    data.gate_post();
                }
                if write == DbWrite::UpdateGrabber {
                    stats.grab_update += 1;
                } else {
                    stats.grab_insert += 1;
                }
            }

            Action::Db(DbWrite::End, data) => {
                db_try!(self.db.interrupted_clear(data.path()));
                if data.od() != OdKind::Scan {
                    self.events.send_od(data.path(), OdEvent::Ended, None, None);
                }
                self.ack(&data);
            }

            Action::ExtMeta(op) => {
                self.on_ext_meta(op);
                stats.ext_ops += 1;
            }

            other => debug!("dbmanager ignoring {other:?}"),
        }
    }

    fn on_new_file(&self, data: Arc<FileData>, stats: &mut LoopStats) {
        let path = data.path().to_path_buf();
        let known_mtime = match self.db.file_mtime(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("database operation failed: {e}");
                self.ack(&data);
                return;
            }
        };

        let mut interrupted = 0;
        let mut changed = false;
        match known_mtime {
            Some(db_mtime) => {
                changed = db_mtime != data.mtime();
                if changed {
                    // Content changed: the stored internal metadata and the
                    // grabber history are stale.
                    db_try!(self.db.file_data_delete(&path));
                    db_try!(self.db.file_grab_delete(&path));
                } else {
                    interrupted = self.db.file_interrupted(&path).ok().flatten().unwrap_or(0);
                    if interrupted == 1 {
                        // Resume an interrupted run: grabbers already done
                        // and pending downloads are restored so finished
                        // work is not repeated.
                        match self.db.grabbers_for_file(&path) {
                            Ok(done) => data.grabbers_done_load(done),
                            Err(e) => warn!("database operation failed: {e}"),
                        }
                        match self.db.dlcontext_for_file(&path) {
                            Ok(items) => data.downloads_load(items),
                            Err(e) => warn!("database operation failed: {e}"),
                        }
                    }
                }
            }
            None => {
                db_try!(self.db.file_insert(&data));
                stats.file_insert += 1;
            }
        }

        if known_mtime.is_none() || changed || interrupted == 1 {
            let write = if known_mtime.is_none() {
                DbWrite::InsertParser
            } else {
                DbWrite::UpdateParser
            };
            self.dispatcher
                .push(data.band(), Action::Db(write, data));
            return;
        }

        // Unchanged and complete: observed, but nothing to do.
        db_try!(self.db.file_checked_set(&path));
        if data.od() != OdKind::Scan {
            self.events.send_od(&path, OdEvent::Ended, None, None);
        }
        stats.file_nochange += 1;
        self.ack(&data);
    }

    fn on_ext_meta(&self, op: ExtMetaOp) {
        db_try!(apply_ext_meta(&self.db, op));
    }

    /// Release one slot of the scanner barrier; on-demand ingestions are not
    /// part of it.
    fn ack(&self, data: &FileData) {
        if data.od() != OdKind::New {
            self.scanner.send(Band::Normal, ScanMsg::Acknowledge);
        }
    }

    /// End-of-loop reconciliation.
    fn sweep(&self, stats: &LoopStats) -> u32 {
        let mut deleted = 0u32;

        db_try!(self.db.begin_transaction());

        let unchecked = match self.db.files_unchecked() {
            Ok(paths) => paths,
            Err(e) => {
                warn!("database operation failed: {e}");
                Vec::new()
            }
        };

        for path in unchecked {
            if self.file_is_gone(&path) {
                db_try!(self.db.step_transaction(self.commit_interval, deleted));
                db_try!(self.db.file_data_delete(&path));
                db_try!(self.db.file_delete(&path));
                deleted += 1;
            }
        }

        if stats.file_update > 0 || stats.grab_insert > 0 || stats.grab_update > 0 || deleted > 0 {
            match self.db.cleanup() {
                Ok(cleaned) => debug!(cleaned, "orphan cleanup"),
                Err(e) => warn!("database operation failed: {e}"),
            }
        }

        // Anything still marked in-flight re-enters the pipeline next loop.
        db_try!(self.db.interrupted_fix());
        db_try!(self.db.end_transaction());

        deleted
    }

    /// A file disappears from the library when it no longer exists, lies
    /// outside every configured root, or lost its accepted suffix.
    fn file_is_gone(&self, path: &Path) -> bool {
        !self.scanner.path_contains(path)
            || !self.scanner.suffix_matches(path)
            || !path.exists()
    }
}

/// Apply one external-metadata request. Shared between the worker and the
/// direct path used when the pipeline is stopped.
pub(crate) fn apply_ext_meta(db: &Database, op: ExtMetaOp) -> Result<()> {
    match op {
        ExtMetaOp::Insert {
            path,
            name,
            value,
            lang,
            group,
        } => db.metadata_ext_insert(&path, &name, &value, lang, group),
        ExtMetaOp::Update {
            path,
            name,
            old_value,
            new_value,
            lang,
        } => db.metadata_ext_update(&path, &name, &old_value, &new_value, lang),
        ExtMetaOp::Delete { path, name, value } => db.metadata_delete(&path, &name, &value),
        ExtMetaOp::Priority {
            path,
            name,
            value,
            priority,
        } => db.metadata_priority(&path, name.as_deref(), value.as_deref(), priority),
    }
}
