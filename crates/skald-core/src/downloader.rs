//! Downloader stage: fetches the artwork queued by grabbers.
//!
//! A single worker resolves each item's destination from the configured map
//! (falling back to the default destination), fetches it, and advances the
//! record. When a shutdown interrupts the batch the step is left untouched,
//! so the persisted download context brings the remainder back next run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::DlKind;
use crate::error::{Result, SkaldError};
use crate::fifo::{Band, Fifo};
use crate::filedata::Action;
use crate::net::HttpClient;
use crate::sync::PauseGate;

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Downloader {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    http: Arc<HttpClient>,
    destinations: Mutex<[Option<PathBuf>; DlKind::COUNT]>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Downloader {
    pub fn new(http: Arc<HttpClient>, cancel: CancellationToken) -> Self {
        Self {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel,
            http,
            destinations: Mutex::new(Default::default()),
            thread: Mutex::new(None),
        }
    }

    pub fn fifo(&self) -> Arc<Fifo<Action>> {
        Arc::clone(&self.fifo)
    }

    pub fn destination_set(&self, kind: DlKind, path: impl Into<PathBuf>) {
        relock(&self.destinations)[kind as usize] = Some(path.into());
    }

    pub fn destination_get(&self, kind: DlKind) -> Option<PathBuf> {
        relock(&self.destinations)[kind as usize].clone()
    }

    pub fn pause_toggle(&self) {
        let fifo = Arc::clone(&self.fifo);
        self.gate
            .toggle(1, move || fifo.push(Band::High, Action::Pause));
    }

    pub fn run(&self, dispatcher: Arc<Fifo<Action>>) -> Result<()> {
        let worker = Worker {
            fifo: Arc::clone(&self.fifo),
            gate: Arc::clone(&self.gate),
            cancel: self.cancel.clone(),
            http: Arc::clone(&self.http),
            destinations: relock(&self.destinations).clone(),
            dispatcher,
        };

        let handle = std::thread::Builder::new()
            .name("skald-downloader".into())
            .spawn(move || worker.run())
            .map_err(|e| SkaldError::Thread(e.to_string()))?;

        let mut slot = relock(&self.thread);
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let handle = relock(&self.thread).take();
        if let Some(handle) = handle {
            self.fifo.push(Band::High, Action::Kill);
            self.gate.force_resume(1);
            if handle.join().is_err() {
                warn!("downloader thread panicked");
            }
        }
    }
}

struct Worker {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    http: Arc<HttpClient>,
    destinations: [Option<PathBuf>; DlKind::COUNT],
    dispatcher: Arc<Fifo<Action>>,
}

impl Worker {
    fn destination(&self, kind: DlKind) -> Option<&PathBuf> {
        self.destinations[kind as usize]
            .as_ref()
            .or_else(|| self.destinations[DlKind::Default as usize].as_ref())
    }

    fn run(self) {
        loop {
            match self.fifo.pop() {
                Action::Kill => break,
                Action::Pause => {
                    self.gate.worker_pause();
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
                Action::Db(write, data) => {
                    let mut interrupted = false;

                    for item in data.downloads() {
                        if self.cancel.is_cancelled() {
                            interrupted = true;
                            break;
                        }
                        let Some(dir) = self.destination(item.dst) else {
                            debug!(url = item.url, "no destination configured");
                            continue;
                        };
                        let dest = dir.join(&item.name);
                        match self.http.save_to_disk(&item.url, &dest, &self.cancel) {
                            Ok(()) => {
                                debug!(url = item.url, dest = %dest.display(), "downloaded")
                            }
                            Err(SkaldError::Cancelled) => {
                                interrupted = true;
                                break;
                            }
                            Err(e) => warn!(url = item.url, "download failed: {e}"),
                        }
                    }

                    // An interrupted batch keeps its step so the persisted
                    // context resumes it on the next run.
                    let write = if interrupted {
                        write
                    } else {
                        data.step_increase(write)
                    };
                    let band = data.band();
                    self.dispatcher.push(band, Action::Db(write, data));
                }
                other => debug!("downloader ignoring {other:?}"),
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filedata::{DbWrite, FileData, OdKind, Step};

    fn downloader() -> Downloader {
        Downloader::new(
            Arc::new(HttpClient::new().unwrap()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_destination_fallback_to_default() {
        let d = downloader();
        d.destination_set(DlKind::Default, "/tmp/dl");
        d.destination_set(DlKind::Cover, "/tmp/covers");
        assert_eq!(d.destination_get(DlKind::Cover).unwrap(), PathBuf::from("/tmp/covers"));
        assert_eq!(d.destination_get(DlKind::FanArt), None);

        let worker = Worker {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel: CancellationToken::new(),
            http: Arc::new(HttpClient::new().unwrap()),
            destinations: relock(&d.destinations).clone(),
            dispatcher: Arc::new(Fifo::new()),
        };
        assert_eq!(
            worker.destination(DlKind::FanArt).unwrap(),
            &PathBuf::from("/tmp/dl")
        );
        assert_eq!(
            worker.destination(DlKind::Cover).unwrap(),
            &PathBuf::from("/tmp/covers")
        );
    }

    #[test]
    fn test_record_without_downloads_advances() {
        let d = downloader();
        let dispatcher = Arc::new(Fifo::new());
        d.run(Arc::clone(&dispatcher)).unwrap();

        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Parsing,
        );
        data.step_increase(DbWrite::InsertParser);
        data.step_increase(DbWrite::InsertParser); // -> Downloading

        d.fifo()
            .push(Band::Normal, Action::Db(DbWrite::InsertGrabber, data));
        match dispatcher.pop() {
            Action::Db(DbWrite::InsertGrabber, data) => {
                assert_eq!(data.step(), Step::Ending)
            }
            other => panic!("unexpected: {other:?}"),
        }
        d.stop();
    }
}
