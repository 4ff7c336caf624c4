//! The in-flight record of one media file and the actions that move it
//! between stages.
//!
//! A [`FileData`] is created by the scanner (or the on-demand worker) and
//! travels through every stage behind an `Arc`. The dispatcher routinely
//! hands the same record to the DB-Manager and to the next stage at once, so
//! the mutable parts sit behind their own locks; the per-file
//! [`Semaphore`](crate::sync::Semaphore) gates the next grabber until the
//! DB-Manager has consumed the previous grabber's metadata.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{DlKind, MetaPriority};
use crate::fifo::Band;
use crate::meta::{Lang, MetaList};
use crate::sync::Semaphore;

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Media kind assigned by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
    #[default]
    Null,
    Audio,
    Video,
    Image,
    Playlist,
}

impl FileType {
    fn as_u8(self) -> u8 {
        match self {
            FileType::Null => 0,
            FileType::Audio => 1,
            FileType::Video => 2,
            FileType::Image => 3,
            FileType::Playlist => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => FileType::Audio,
            2 => FileType::Video,
            3 => FileType::Image,
            4 => FileType::Playlist,
            _ => FileType::Null,
        }
    }

    /// Stable row id in the `type` table; `Null` is stored as SQL NULL.
    pub(crate) fn db_id(self) -> Option<i64> {
        match self {
            FileType::Null => None,
            other => Some(other.as_u8() as i64),
        }
    }

    pub(crate) fn from_db_id(id: Option<i64>) -> Self {
        match id {
            Some(v @ 1..=4) => FileType::from_u8(v as u8),
            _ => FileType::Null,
        }
    }
}

/// Pipeline stage a record is currently targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Parsing = 0,
    Grabbing = 1,
    Downloading = 2,
    Ending = 3,
}

impl Step {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Step::Parsing,
            1 => Step::Grabbing,
            2 => Step::Downloading,
            _ => Step::Ending,
        }
    }
}

/// Origin of a record with respect to the on-demand interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdKind {
    /// Regular scanner discovery.
    Scan,
    /// Created by the on-demand worker; outside the scanner ack barrier.
    New,
    /// Scanner record later elevated by an on-demand request.
    Elevated,
}

impl OdKind {
    fn as_u8(self) -> u8 {
        match self {
            OdKind::Scan => 0,
            OdKind::New => 1,
            OdKind::Elevated => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => OdKind::New,
            2 => OdKind::Elevated,
            _ => OdKind::Scan,
        }
    }
}

/// One pending artwork download attached to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub dst: DlKind,
    pub name: String,
}

/// Read-only snapshot handed to metadata event callbacks.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub mtime: i64,
    pub size: u64,
    pub file_type: FileType,
}

/// In-flight record of one media file.
pub struct FileData {
    path: PathBuf,
    mtime: i64,
    size: u64,
    outofpath: bool,

    od: AtomicU8,
    band: AtomicU8,
    step: AtomicU8,
    file_type: AtomicU8,

    /// Set by the dispatcher when the DB-Manager still owns the previous
    /// grabber metadata; the grabber worker then blocks on `grabber_gate`.
    wait: AtomicBool,
    /// Set when grabber selection gave up; the record is requeued unchanged.
    skip: AtomicBool,

    meta_parser: Mutex<MetaList>,
    meta_grabber: Mutex<MetaList>,
    grabber_name: Mutex<Option<&'static str>>,
    grabbers_done: Mutex<Vec<String>>,
    downloads: Mutex<Vec<DownloadItem>>,

    grabber_gate: Semaphore,
}

impl FileData {
    pub fn new(
        path: impl Into<PathBuf>,
        mtime: i64,
        size: u64,
        outofpath: bool,
        od: OdKind,
        band: Band,
        step: Step,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            mtime,
            size,
            outofpath,
            od: AtomicU8::new(od.as_u8()),
            band: AtomicU8::new(match band {
                Band::Normal => 0,
                Band::High => 1,
            }),
            step: AtomicU8::new(step as u8),
            file_type: AtomicU8::new(FileType::Null.as_u8()),
            wait: AtomicBool::new(false),
            skip: AtomicBool::new(false),
            meta_parser: Mutex::new(MetaList::new()),
            meta_grabber: Mutex::new(MetaList::new()),
            grabber_name: Mutex::new(None),
            grabbers_done: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            grabber_gate: Semaphore::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn outofpath(&self) -> bool {
        self.outofpath
    }

    pub fn od(&self) -> OdKind {
        OdKind::from_u8(self.od.load(Ordering::SeqCst))
    }

    pub fn set_od(&self, od: OdKind) {
        self.od.store(od.as_u8(), Ordering::SeqCst);
    }

    pub fn band(&self) -> Band {
        if self.band.load(Ordering::SeqCst) == 1 {
            Band::High
        } else {
            Band::Normal
        }
    }

    pub fn set_band(&self, band: Band) {
        self.band.store(
            match band {
                Band::Normal => 0,
                Band::High => 1,
            },
            Ordering::SeqCst,
        );
    }

    pub fn step(&self) -> Step {
        Step::from_u8(self.step.load(Ordering::SeqCst))
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_u8(self.file_type.load(Ordering::SeqCst))
    }

    pub fn set_file_type(&self, ty: FileType) {
        self.file_type.store(ty.as_u8(), Ordering::SeqCst);
    }

    pub fn wait_flag(&self) -> bool {
        self.wait.load(Ordering::SeqCst)
    }

    pub fn set_wait(&self, v: bool) {
        self.wait.store(v, Ordering::SeqCst);
    }

    pub fn skip_flag(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    pub fn set_skip(&self, v: bool) {
        self.skip.store(v, Ordering::SeqCst);
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            path: self.path.clone(),
            mtime: self.mtime,
            size: self.size,
            file_type: self.file_type(),
        }
    }

    pub fn meta_parser(&self) -> MutexGuard<'_, MetaList> {
        relock(&self.meta_parser)
    }

    pub fn meta_grabber(&self) -> MutexGuard<'_, MetaList> {
        relock(&self.meta_grabber)
    }

    /// Move the accumulated grabber metadata out of the record.
    pub fn take_meta_grabber(&self) -> MetaList {
        std::mem::take(&mut *relock(&self.meta_grabber))
    }

    /// Append one grabber metadata entry; used by grabber plugins.
    pub fn add_grabber_meta(
        &self,
        name: &str,
        value: &str,
        lang: Lang,
        priority: MetaPriority,
    ) {
        relock(&self.meta_grabber).add_auto(name, value, lang, priority);
    }

    /// Queue one artwork download; used by grabber plugins.
    pub fn add_download(&self, url: &str, dst: DlKind, name: &str) {
        relock(&self.downloads).push(DownloadItem {
            url: url.to_string(),
            dst,
            name: name.to_string(),
        });
    }

    pub fn grabber_name(&self) -> Option<&'static str> {
        *relock(&self.grabber_name)
    }

    pub fn set_grabber_name(&self, name: Option<&'static str>) {
        *relock(&self.grabber_name) = name;
    }

    pub fn grabbers_done(&self) -> Vec<String> {
        relock(&self.grabbers_done).clone()
    }

    pub fn grabber_done(&self, name: &str) -> bool {
        relock(&self.grabbers_done).iter().any(|g| g == name)
    }

    pub fn mark_grabber_done(&self, name: &str) {
        self.grabbers_done_load(std::iter::once(name.to_string()));
    }

    /// Preload the done-list (interrupted-run recovery).
    pub fn grabbers_done_load(&self, names: impl IntoIterator<Item = String>) {
        let mut done = relock(&self.grabbers_done);
        for name in names {
            if !done.iter().any(|g| *g == name) {
                done.push(name);
            }
        }
    }

    pub fn downloads(&self) -> Vec<DownloadItem> {
        relock(&self.downloads).clone()
    }

    pub fn has_downloads(&self) -> bool {
        !relock(&self.downloads).is_empty()
    }

    /// Preload pending downloads (interrupted-run recovery).
    pub fn downloads_load(&self, items: impl IntoIterator<Item = DownloadItem>) {
        let mut downloads = relock(&self.downloads);
        for item in items {
            if !downloads.contains(&item) {
                downloads.push(item);
            }
        }
    }

    /// Release the grabber gate (DB-Manager side, after the grabber metadata
    /// reached the store).
    pub fn gate_post(&self) {
        self.grabber_gate.post();
    }

    /// Block until the gate is posted (grabber side, when `wait` is set).
    pub fn gate_wait(&self) {
        self.grabber_gate.wait();
    }

    /// Advance to the next step, rewriting a parser action into its grabber
    /// counterpart when the grabbing stage has been passed.
    pub fn step_increase(&self, action: DbWrite) -> DbWrite {
        let step = self.step();
        match step {
            Step::Parsing => {
                self.step.store(Step::Grabbing as u8, Ordering::SeqCst);
                action
            }
            Step::Grabbing => {
                self.step.store(Step::Downloading as u8, Ordering::SeqCst);
                action.into_grab()
            }
            Step::Downloading => {
                self.step.store(Step::Ending as u8, Ordering::SeqCst);
                action
            }
            Step::Ending => action,
        }
    }

    /// Keep the current step but rewrite the action for another grabbing
    /// round.
    pub fn step_continue(&self, action: DbWrite) -> DbWrite {
        if self.step() == Step::Grabbing {
            action.into_grab()
        } else {
            action
        }
    }
}

impl std::fmt::Debug for FileData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileData")
            .field("path", &self.path)
            .field("mtime", &self.mtime)
            .field("step", &self.step())
            .field("type", &self.file_type())
            .field("od", &self.od())
            .finish_non_exhaustive()
    }
}

/// Kind of a row-modifying write carried with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbWrite {
    InsertParser,
    UpdateParser,
    InsertGrabber,
    UpdateGrabber,
    End,
}

impl DbWrite {
    fn into_grab(self) -> DbWrite {
        match self {
            DbWrite::InsertParser => DbWrite::InsertGrabber,
            DbWrite::UpdateParser => DbWrite::UpdateGrabber,
            other => other,
        }
    }

    pub fn is_grab(self) -> bool {
        matches!(self, DbWrite::InsertGrabber | DbWrite::UpdateGrabber)
    }
}

/// External-metadata request queued by the public API; applied on the
/// DB-Manager thread so every write stays there.
#[derive(Debug, Clone)]
pub enum ExtMetaOp {
    Insert {
        path: PathBuf,
        name: String,
        value: String,
        lang: Lang,
        group: crate::meta::MetaGroup,
    },
    Update {
        path: PathBuf,
        name: String,
        old_value: String,
        new_value: String,
        lang: Lang,
    },
    Delete {
        path: PathBuf,
        name: String,
        value: String,
    },
    Priority {
        path: PathBuf,
        name: Option<String>,
        value: Option<String>,
        priority: MetaPriority,
    },
}

/// Message carried by every pipeline stage queue.
#[derive(Debug)]
pub enum Action {
    /// Unblock a waiter for shutdown; re-pushed by pools with several
    /// workers.
    Kill,
    /// Park the worker on its stage pause gate.
    Pause,
    /// Scanner discovery, consumed by the DB-Manager.
    NewFile(Arc<FileData>),
    /// Record plus the write the DB-Manager must apply for it.
    Db(DbWrite, Arc<FileData>),
    /// Loop barrier from the scanner, forwarded down the pipeline.
    NextLoop,
    /// External metadata request from the public API.
    ExtMeta(ExtMetaOp),
}

impl Action {
    /// The record carried by this action, if any.
    pub fn file(&self) -> Option<&Arc<FileData>> {
        match self {
            Action::NewFile(data) | Action::Db(_, data) => Some(data),
            _ => None,
        }
    }

    /// Whether this action still carries work for `path` (used by the
    /// on-demand queue search; an `End` write is no longer elevatable).
    pub fn matches_pending(&self, path: &Path) -> bool {
        match self {
            Action::NewFile(data) => data.path() == path,
            Action::Db(write, data) => *write != DbWrite::End && data.path() == path,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Arc<FileData> {
        FileData::new(
            "/m/a.mp3",
            1000,
            42,
            false,
            OdKind::Scan,
            Band::Normal,
            Step::Parsing,
        )
    }

    #[test]
    fn test_step_progression_rewrites_actions() {
        let data = record();
        assert_eq!(data.step(), Step::Parsing);

        let action = data.step_increase(DbWrite::InsertParser);
        assert_eq!(action, DbWrite::InsertParser);
        assert_eq!(data.step(), Step::Grabbing);

        let action = data.step_increase(DbWrite::InsertParser);
        assert_eq!(action, DbWrite::InsertGrabber);
        assert_eq!(data.step(), Step::Downloading);

        let action = data.step_increase(DbWrite::InsertGrabber);
        assert_eq!(action, DbWrite::InsertGrabber);
        assert_eq!(data.step(), Step::Ending);
    }

    #[test]
    fn test_step_continue_keeps_grabbing() {
        let data = record();
        data.step_increase(DbWrite::UpdateParser);
        assert_eq!(data.step(), Step::Grabbing);
        let action = data.step_continue(DbWrite::UpdateParser);
        assert_eq!(action, DbWrite::UpdateGrabber);
        assert_eq!(data.step(), Step::Grabbing);
    }

    #[test]
    fn test_done_list_deduplicates() {
        let data = record();
        data.mark_grabber_done("local");
        data.mark_grabber_done("local");
        assert!(data.grabber_done("local"));
        assert_eq!(data.grabbers_done().len(), 1);
    }

    #[test]
    fn test_matches_pending_ignores_end() {
        let data = record();
        let action = Action::Db(DbWrite::End, Arc::clone(&data));
        assert!(!action.matches_pending(Path::new("/m/a.mp3")));
        let action = Action::NewFile(data);
        assert!(action.matches_pending(Path::new("/m/a.mp3")));
    }
}
