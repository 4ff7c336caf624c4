//! Filesystem scanner.
//!
//! Walks the configured roots once per loop, emitting a `NewFile` action for
//! every regular file with an accepted suffix, then waits for the DB-Manager
//! to acknowledge each one before starting the next loop. The inter-loop
//! sleep is interruptible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::config::{RunOptions, ScannerConfig};
use crate::error::{Result, SkaldError};
use crate::event::{EventHandler, GlEvent};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, FileData, OdKind, Step};
use crate::sync::SleepTimer;

/// Message on the scanner's own queue (the ack barrier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMsg {
    Acknowledge,
    Kill,
}

#[derive(Debug, Clone)]
struct ScanRoot {
    location: PathBuf,
    /// Maximum walk depth below the root: 1 for non-recursive roots,
    /// [`ScannerConfig::RECURSION_MAX`] otherwise.
    max_depth: usize,
}

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Scanner {
    fifo: Arc<Fifo<ScanMsg>>,
    roots: Mutex<Vec<ScanRoot>>,
    suffixes: Mutex<Vec<String>>,
    timer: Arc<SleepTimer>,
    cancel: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            fifo: Arc::new(Fifo::new()),
            roots: Mutex::new(Vec::new()),
            suffixes: Mutex::new(Vec::new()),
            timer: Arc::new(SleepTimer::new()),
            cancel,
            thread: Mutex::new(None),
        }
    }

    /* Configuration */

    pub fn path_add(&self, location: impl Into<PathBuf>, recursive: bool) {
        let mut location = location.into();
        // Normalise away a trailing separator so containment checks are
        // purely component-wise.
        if location.as_os_str().len() > 1 {
            if let Some(s) = location.to_str() {
                if s.ends_with(std::path::MAIN_SEPARATOR) {
                    location = PathBuf::from(s.trim_end_matches(std::path::MAIN_SEPARATOR));
                }
            }
        }
        let mut roots = relock(&self.roots);
        if roots.iter().any(|r| r.location == location) {
            return;
        }
        roots.push(ScanRoot {
            location,
            max_depth: if recursive {
                ScannerConfig::RECURSION_MAX
            } else {
                1
            },
        });
    }

    pub fn suffix_add(&self, suffix: impl Into<String>) {
        let suffix = suffix.into();
        let suffix = suffix.trim_start_matches('.').to_string();
        let mut suffixes = relock(&self.suffixes);
        if !suffixes.iter().any(|s| s.eq_ignore_ascii_case(&suffix)) {
            suffixes.push(suffix);
        }
    }

    pub fn has_roots(&self) -> bool {
        !relock(&self.roots).is_empty()
    }

    /// Whether `path` carries one of the accepted suffixes. An empty suffix
    /// list accepts everything.
    pub fn suffix_matches(&self, path: &Path) -> bool {
        let suffixes = relock(&self.suffixes);
        if suffixes.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        suffixes.iter().any(|s| s.eq_ignore_ascii_case(ext))
    }

    /// Whether `path` lies inside a configured root, within its recursion
    /// depth.
    pub fn path_contains(&self, path: &Path) -> bool {
        let roots = relock(&self.roots);
        roots.iter().any(|root| {
            let Ok(rest) = path.strip_prefix(&root.location) else {
                return false;
            };
            let depth = rest.components().count();
            depth >= 1 && depth <= root.max_depth
        })
    }

    /* Queue plumbing */

    pub fn send(&self, band: Band, msg: ScanMsg) {
        self.fifo.push(band, msg);
    }

    /// Interrupt the inter-loop sleep.
    pub fn wakeup(&self) {
        self.timer.wakeup();
    }

    /* Lifecycle */

    pub fn run(
        &self,
        opts: &RunOptions,
        db_fifo: Arc<Fifo<Action>>,
        events: Arc<EventHandler>,
    ) -> Result<()> {
        if !self.has_roots() {
            return Err(SkaldError::NoScanRoot);
        }

        let worker = Worker {
            fifo: Arc::clone(&self.fifo),
            roots: relock(&self.roots).clone(),
            suffixes: relock(&self.suffixes).clone(),
            timer: Arc::clone(&self.timer),
            cancel: self.cancel.clone(),
            db_fifo,
            events,
            opts: opts.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("skald-scanner".into())
            .spawn(move || worker.run())
            .map_err(|e| SkaldError::Thread(e.to_string()))?;

        let mut slot = relock(&self.thread);
        *slot = Some(handle);
        Ok(())
    }

    /// Join the scanner; returns once every configured loop has completed.
    pub fn wait(&self) {
        let handle = relock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("scanner thread panicked");
            }
        }
    }

    /// Force the scanner out of its loop and join it.
    pub fn stop(&self) {
        let handle = relock(&self.thread).take();
        if let Some(handle) = handle {
            self.fifo.push(Band::High, ScanMsg::Kill);
            self.timer.wakeup();
            if handle.join().is_err() {
                warn!("scanner thread panicked");
            }
        }
    }
}

struct Worker {
    fifo: Arc<Fifo<ScanMsg>>,
    roots: Vec<ScanRoot>,
    suffixes: Vec<String>,
    timer: Arc<SleepTimer>,
    cancel: CancellationToken,
    db_fifo: Arc<Fifo<Action>>,
    events: Arc<EventHandler>,
    opts: RunOptions,
}

impl Worker {
    fn suffix_matches(&self, path: &Path) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.suffixes.iter().any(|s| s.eq_ignore_ascii_case(ext))
    }

    fn scan_root(&self, root: &ScanRoot) -> u64 {
        let mut files = 0;
        for entry in WalkDir::new(&root.location)
            .max_depth(root.max_depth)
            .follow_links(false)
        {
            if self.cancel.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root.location.display(), "walk error: {e}");
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if entry.depth() == root.max_depth && root.max_depth > 1 {
                    warn!(
                        path = %entry.path().display(),
                        "max recursion depth reached"
                    );
                }
                continue;
            }
            if !entry.file_type().is_file() || !self.suffix_matches(entry.path()) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), "stat failed: {e}");
                    continue;
                }
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            let data = FileData::new(
                entry.path(),
                mtime,
                meta.len(),
                false,
                OdKind::Scan,
                Band::Normal,
                Step::Parsing,
            );
            let band = data.band();
            self.db_fifo.push(band, Action::NewFile(data));
            files += 1;
        }
        files
    }

    fn run(self) {
        info!(
            loops = self.opts.loops,
            timeout = ?self.opts.timeout,
            "scanner started"
        );

        if let Some(delay) = self.opts.delay {
            self.timer.sleep(delay);
            if self.cancel.is_cancelled() {
                warn!("scanner kill forced");
                return;
            }
        }

        // Negative or zero loop count means run forever.
        let mut remaining = self.opts.loops;
        loop {
            self.events.send_gl(GlEvent::ScannerBegin);

            let mut counts = Vec::with_capacity(self.roots.len());
            for root in &self.roots {
                info!(root = %root.location.display(), "start scanning");
                let files = self.scan_root(root);
                info!(root = %root.location.display(), files, "end scanning");
                counts.push(files);
            }

            self.events.send_gl(GlEvent::ScannerEnd);

            // Back-pressure barrier: one ack per discovered file.
            for &count in &counts {
                let mut files = count;
                while files > 0 {
                    match self.fifo.pop() {
                        ScanMsg::Acknowledge => files -= 1,
                        ScanMsg::Kill => {
                            warn!("scanner kill forced");
                            return;
                        }
                    }
                    if self.cancel.is_cancelled() {
                        warn!("scanner kill forced");
                        return;
                    }
                }
            }

            self.events.send_gl(GlEvent::ScannerAcks);

            if remaining > 0 {
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }

            // More loops remain: let the DB-Manager close this loop out.
            self.db_fifo.push(Band::Normal, Action::NextLoop);
            self.events.send_gl(GlEvent::ScannerSleep);
            if let Some(timeout) = self.opts.timeout {
                self.timer.sleep(timeout);
            }

            if self.cancel.is_cancelled() {
                warn!("scanner kill forced");
                return;
            }
        }

        self.events.send_gl(GlEvent::ScannerExit);
        debug!("scanner finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> Scanner {
        Scanner::new(CancellationToken::new())
    }

    #[test]
    fn test_suffix_matching_is_case_insensitive() {
        let s = scanner();
        s.suffix_add("mp3");
        s.suffix_add(".OGG");
        assert!(s.suffix_matches(Path::new("/m/a.mp3")));
        assert!(s.suffix_matches(Path::new("/m/a.MP3")));
        assert!(s.suffix_matches(Path::new("/m/a.b.ogg")));
        assert!(!s.suffix_matches(Path::new("/m/a.flac")));
        assert!(!s.suffix_matches(Path::new("/m/mp3")));
    }

    #[test]
    fn test_empty_suffix_list_accepts_everything() {
        let s = scanner();
        assert!(s.suffix_matches(Path::new("/m/a.whatever")));
    }

    #[test]
    fn test_path_containment_respects_depth() {
        let s = scanner();
        s.path_add("/media/music", true);
        s.path_add("/media/flat", false);

        assert!(s.path_contains(Path::new("/media/music/a.mp3")));
        assert!(s.path_contains(Path::new("/media/music/x/y/a.mp3")));
        assert!(!s.path_contains(Path::new("/elsewhere/a.mp3")));

        // Non-recursive root: direct children only.
        assert!(s.path_contains(Path::new("/media/flat/a.mp3")));
        assert!(!s.path_contains(Path::new("/media/flat/sub/a.mp3")));
    }

    #[test]
    fn test_path_add_deduplicates_and_trims_separator() {
        let s = scanner();
        s.path_add("/media/music/", true);
        s.path_add("/media/music", true);
        assert_eq!(relock(&s.roots).len(), 1);
    }

    #[test]
    fn test_scan_emits_newfile_per_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.mp3"), b"x").unwrap();

        let s = scanner();
        s.path_add(dir.path(), true);
        s.suffix_add("mp3");

        let db_fifo = Arc::new(Fifo::new());
        let events = Arc::new(EventHandler::new(Default::default(), false));
        s.run(
            &RunOptions::default(),
            Arc::clone(&db_fifo),
            Arc::clone(&events),
        )
        .unwrap();

        // Drain the two NewFile actions, then release the ack barrier.
        let mut seen = Vec::new();
        for _ in 0..2 {
            match db_fifo.pop() {
                Action::NewFile(data) => {
                    seen.push(data.path().to_path_buf());
                    s.send(Band::Normal, ScanMsg::Acknowledge);
                }
                other => panic!("unexpected action: {other:?}"),
            }
        }
        s.wait();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.extension().unwrap() == "mp3"));
    }

    #[test]
    fn test_run_without_roots_is_refused() {
        let s = scanner();
        let db_fifo = Arc::new(Fifo::new());
        let events = Arc::new(EventHandler::new(Default::default(), false));
        let err = s.run(&RunOptions::default(), db_fifo, events).unwrap_err();
        assert!(matches!(err, SkaldError::NoScanRoot));
    }
}
