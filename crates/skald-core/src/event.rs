//! Event delivery to the embedder.
//!
//! All callbacks run serially on one dedicated worker thread so embedder code
//! never races itself. Three event kinds exist: per-file on-demand
//! milestones, global scanner lifecycle events, and one notification per
//! metadata pair written to the store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::{Result, SkaldError};
use crate::fifo::{Band, Fifo};
use crate::filedata::FileInfo;
use crate::meta::{MetaEntry, MetaList};

/// Per-file milestone reported to the on-demand callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdEvent {
    Parsed,
    Grabbed,
    Ended,
}

/// Scanner lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlEvent {
    ScannerBegin,
    ScannerEnd,
    ScannerSleep,
    ScannerAcks,
    ScannerExit,
}

/// Origin of a metadata notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdEvent {
    ParserMeta,
    GrabberMeta,
}

pub type OdCallback = Box<dyn Fn(&Path, OdEvent, Option<&str>) + Send + Sync>;
pub type GlCallback = Box<dyn Fn(GlEvent) + Send + Sync>;
pub type MdCallback = Box<dyn Fn(MdEvent, Option<&str>, &FileInfo, &MetaEntry) + Send + Sync>;

/// Callbacks supplied by the embedder. All optional.
#[derive(Default)]
pub struct Callbacks {
    pub on_demand: Option<OdCallback>,
    pub global: Option<GlCallback>,
    pub metadata: Option<MdCallback>,
}

enum EventMsg {
    Kill,
    Od {
        path: PathBuf,
        event: OdEvent,
        grabber: Option<String>,
        keys: Option<Vec<String>>,
    },
    Gl(GlEvent),
    Md {
        event: MdEvent,
        grabber: Option<String>,
        file: FileInfo,
        meta: MetaList,
    },
}

pub struct EventHandler {
    fifo: Arc<Fifo<EventMsg>>,
    callbacks: Arc<Callbacks>,
    /// When set, the key list of the running on-demand event is published
    /// here for [`EventHandler::od_meta_keys`].
    od_meta: bool,
    od_keys: Arc<Mutex<Option<Vec<String>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventHandler {
    pub fn new(callbacks: Callbacks, od_meta: bool) -> Self {
        Self {
            fifo: Arc::new(Fifo::new()),
            callbacks: Arc::new(callbacks),
            od_meta,
            od_keys: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        }
    }

    pub fn run(&self) -> Result<()> {
        let fifo = Arc::clone(&self.fifo);
        let callbacks = Arc::clone(&self.callbacks);
        let od_keys = Arc::clone(&self.od_keys);
        let od_meta = self.od_meta;

        let handle = std::thread::Builder::new()
            .name("skald-events".into())
            .spawn(move || worker(fifo, callbacks, od_keys, od_meta))
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
            self.fifo.push(Band::High, EventMsg::Kill);
            if handle.join().is_err() {
                warn!("event handler thread panicked");
            }
        }
    }

    pub fn send_od(
        &self,
        path: &Path,
        event: OdEvent,
        grabber: Option<&str>,
        keys: Option<Vec<String>>,
    ) {
        if self.callbacks.on_demand.is_none() {
            return;
        }
        self.fifo.push(
            Band::Normal,
            EventMsg::Od {
                path: path.to_path_buf(),
                event,
                grabber: grabber.map(str::to_string),
                keys,
            },
        );
    }

    pub fn send_gl(&self, event: GlEvent) {
        if self.callbacks.global.is_none() {
            return;
        }
        self.fifo.push(Band::Normal, EventMsg::Gl(event));
    }

    pub fn send_md(
        &self,
        event: MdEvent,
        grabber: Option<&str>,
        file: FileInfo,
        meta: MetaList,
    ) {
        if self.callbacks.metadata.is_none() || meta.is_empty() {
            return;
        }
        self.fifo.push(
            Band::Normal,
            EventMsg::Md {
                event,
                grabber: grabber.map(str::to_string),
                file,
                meta,
            },
        );
    }

    /// Key list of the on-demand event currently being delivered.
    ///
    /// Only meaningful from inside the on-demand callback (and only when the
    /// handle was opened with `od_meta`); anywhere else the non-blocking
    /// check fails and `None` is returned.
    pub fn od_meta_keys(&self) -> Option<Vec<String>> {
        match self.od_keys.try_lock() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                warn!("od_meta_keys must be called from the on-demand callback");
                None
            }
        }
    }
}

fn worker(
    fifo: Arc<Fifo<EventMsg>>,
    callbacks: Arc<Callbacks>,
    od_keys: Arc<Mutex<Option<Vec<String>>>>,
    od_meta: bool,
) {
    loop {
        match fifo.pop() {
            EventMsg::Kill => break,

            EventMsg::Od {
                path,
                event,
                grabber,
                keys,
            } => {
                let Some(cb) = callbacks.on_demand.as_ref() else {
                    continue;
                };
                if od_meta {
                    let mut slot = od_keys.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = keys;
                }
                cb(&path, event, grabber.as_deref());
                if od_meta {
                    let mut slot = od_keys.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = None;
                }
            }

            EventMsg::Gl(event) => {
                if let Some(cb) = callbacks.global.as_ref() {
                    cb(event);
                }
            }

            EventMsg::Md {
                event,
                grabber,
                file,
                meta,
            } => {
                let Some(cb) = callbacks.metadata.as_ref() else {
                    continue;
                };
                for entry in meta.iter() {
                    cb(event, grabber.as_deref(), &file, entry);
                }
            }
        }
    }
    debug!("event handler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filedata::FileType;
    use std::sync::mpsc;
    use std::time::Duration;

    fn file_info() -> FileInfo {
        FileInfo {
            path: PathBuf::from("/m/a.mp3"),
            mtime: 1000,
            size: 10,
            file_type: FileType::Audio,
        }
    }

    #[test]
    fn test_events_are_delivered_in_order() {
        let (tx, rx) = mpsc::channel();
        let handler = EventHandler::new(
            Callbacks {
                global: Some(Box::new(move |e| tx.send(e).unwrap())),
                ..Default::default()
            },
            false,
        );
        handler.run().unwrap();
        handler.send_gl(GlEvent::ScannerBegin);
        handler.send_gl(GlEvent::ScannerEnd);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            GlEvent::ScannerBegin
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            GlEvent::ScannerEnd
        );
        handler.stop();
    }

    #[test]
    fn test_md_event_fires_once_per_entry() {
        let (tx, rx) = mpsc::channel();
        let handler = EventHandler::new(
            Callbacks {
                metadata: Some(Box::new(move |_, _, _, entry| {
                    tx.send(entry.name.clone()).unwrap()
                })),
                ..Default::default()
            },
            false,
        );
        handler.run().unwrap();

        let mut meta = MetaList::new();
        meta.add_default("title", "A");
        meta.add_default("artist", "X");
        handler.send_md(MdEvent::ParserMeta, None, file_info(), meta);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "title");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "artist");
        handler.stop();
    }

    #[test]
    fn test_od_meta_keys_outside_callback_is_none() {
        let handler = EventHandler::new(
            Callbacks {
                on_demand: Some(Box::new(|_, _, _| {})),
                ..Default::default()
            },
            true,
        );
        assert_eq!(handler.od_meta_keys(), None);
    }

    #[test]
    fn test_od_event_with_grabber_id() {
        let (tx, rx) = mpsc::channel();
        let handler = EventHandler::new(
            Callbacks {
                on_demand: Some(Box::new(move |path, event, grabber| {
                    tx.send((path.to_path_buf(), event, grabber.map(str::to_string)))
                        .unwrap()
                })),
                ..Default::default()
            },
            false,
        );
        handler.run().unwrap();
        handler.send_od(Path::new("/m/a.mp3"), OdEvent::Grabbed, Some("tmdb"), None);
        let (path, event, grabber) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(path, PathBuf::from("/m/a.mp3"));
        assert_eq!(event, OdEvent::Grabbed);
        assert_eq!(grabber.as_deref(), Some("tmdb"));
        handler.stop();
    }
}
