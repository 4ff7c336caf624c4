//! Parser stage: a small pool of workers extracting embedded metadata.

mod decrap;
mod probe;

pub use decrap::{Cleaned, Decrapifier};
pub use probe::{probe, Probed};

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::{priority, PipelineConfig};
use crate::error::{Result, SkaldError};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, FileData, FileType};
use crate::meta::{keys, Lang};
use crate::sync::PauseGate;

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Parser {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    nb: usize,
    decrapifier: Option<Mutex<Decrapifier>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Parser {
    pub fn new(nb: usize, decrapifier: bool, cancel: CancellationToken) -> Self {
        let nb = nb.clamp(1, PipelineConfig::PARSER_THREADS_MAX);
        Self {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel,
            nb,
            decrapifier: decrapifier.then(|| Mutex::new(Decrapifier::new())),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn fifo(&self) -> Arc<Fifo<Action>> {
        Arc::clone(&self.fifo)
    }

    pub fn workers(&self) -> usize {
        self.nb
    }

    /// Append a keyword to the decrapifier blacklist. Ignored when the
    /// decrapifier is disabled.
    pub fn keyword_add(&self, keyword: &str) {
        if let Some(decrap) = &self.decrapifier {
            relock(decrap).add_keyword(keyword);
        }
    }

    pub fn pause_toggle(&self) {
        let fifo = Arc::clone(&self.fifo);
        self.gate
            .toggle(self.nb, move || fifo.push(Band::High, Action::Pause));
    }

    pub fn run(&self, dispatcher: Arc<Fifo<Action>>) -> Result<()> {
        // The blacklist is frozen at run time; workers share one snapshot.
        let decrap: Option<Arc<Decrapifier>> = self
            .decrapifier
            .as_ref()
            .map(|d| Arc::new(relock(d).clone()));

        let mut threads = relock(&self.threads);
        for i in 0..self.nb {
            let worker = Worker {
                fifo: Arc::clone(&self.fifo),
                gate: Arc::clone(&self.gate),
                cancel: self.cancel.clone(),
                dispatcher: Arc::clone(&dispatcher),
                decrap: decrap.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("skald-parser-{i}"))
                .spawn(move || worker.run())
                .map_err(|e| SkaldError::Thread(e.to_string()))?;
            threads.push(handle);
        }
        Ok(())
    }

    pub fn stop(&self) {
        let handles: Vec<_> = relock(&self.threads).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for _ in &handles {
            self.fifo.push(Band::High, Action::Kill);
        }
        self.gate.force_resume(self.nb);
        for handle in handles {
            if handle.join().is_err() {
                warn!("parser worker panicked");
            }
        }
    }
}

struct Worker {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    dispatcher: Arc<Fifo<Action>>,
    decrap: Option<Arc<Decrapifier>>,
}

impl Worker {
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
                    self.parse(&data);
                    let write = data.step_increase(write);
                    let band = data.band();
                    self.dispatcher.push(band, Action::Db(write, data));
                }
                other => debug!("parser ignoring {other:?}"),
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
    }

    fn parse(&self, data: &FileData) {
        let probed = match probe::probe(data.path()) {
            Ok(probed) => probed,
            Err(e) => {
                // The file still advances, with no parser metadata.
                warn!(path = %data.path().display(), "probe failed: {e}");
                Probed {
                    file_type: FileType::Null,
                    tags: Vec::new(),
                }
            }
        };

        data.set_file_type(probed.file_type);

        let mut meta = data.meta_parser();
        for (name, value) in &probed.tags {
            meta.add_auto(name, value, Lang::Undef, priority::NORMAL);
        }

        // No embedded title: derive one from the filename.
        if let Some(decrap) = &self.decrap {
            if meta.get(keys::TITLE).is_none() {
                let cleaned = decrap.clean_path(data.path());
                if !cleaned.title.is_empty() {
                    meta.add_auto(keys::TITLE, &cleaned.title, Lang::Undef, priority::NORMAL);
                }
                if let Some(season) = cleaned.season {
                    meta.add_auto(keys::SEASON, &season.to_string(), Lang::Undef, priority::NORMAL);
                }
                if let Some(episode) = cleaned.episode {
                    meta.add_auto(
                        keys::EPISODE,
                        &episode.to_string(),
                        Lang::Undef,
                        priority::NORMAL,
                    );
                }
            }
        }
    }
}
