//! Step router.
//!
//! The dispatcher is the only component that advances a record between
//! stages. For the grabbing and downloading steps it forwards the pending
//! write to the DB-Manager *and* hands the record to the stage worker; when a
//! grabber write is in flight it arms the record's wait gate so the next
//! grabber cannot touch the grabber metadata before the DB-Manager consumed
//! it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, SkaldError};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, DbWrite, Step};
use crate::sync::PauseGate;

pub struct Dispatcher {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Queues of the stages the dispatcher routes to.
#[derive(Clone)]
pub struct Targets {
    pub db: Arc<Fifo<Action>>,
    pub parser: Arc<Fifo<Action>>,
    pub grabber: Arc<Fifo<Action>>,
    pub downloader: Arc<Fifo<Action>>,
}

impl Dispatcher {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel,
            thread: Mutex::new(None),
        }
    }

    pub fn fifo(&self) -> Arc<Fifo<Action>> {
        Arc::clone(&self.fifo)
    }

    pub fn send(&self, band: Band, action: Action) {
        self.fifo.push(band, action);
    }

    /// Pause or resume the worker (on-demand barrier).
    pub fn pause_toggle(&self) {
        let fifo = Arc::clone(&self.fifo);
        self.gate
            .toggle(1, move || fifo.push(Band::High, Action::Pause));
    }

    pub fn run(&self, targets: Targets) -> Result<()> {
        let fifo = Arc::clone(&self.fifo);
        let gate = Arc::clone(&self.gate);
        let cancel = self.cancel.clone();

        let handle = std::thread::Builder::new()
            .name("skald-dispatcher".into())
            .spawn(move || worker(fifo, gate, cancel, targets))
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
                warn!("dispatcher thread panicked");
            }
        }
    }
}

fn worker(
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    targets: Targets,
) {
    loop {
        match fifo.pop() {
            Action::Kill => break,
            Action::Pause => {
                gate.worker_pause();
                if cancel.is_cancelled() {
                    break;
                }
            }

            // Loop barrier: grabber plugins get their per-loop hook.
            Action::NextLoop => targets.grabber.push(Band::Normal, Action::NextLoop),

            Action::Db(write, data) => {
                let step = data.step();
                let band = data.band();
                trace!(step = ?step, path = %data.path().display(), "dispatch");

                match step {
                    Step::Parsing => {
                        targets.parser.push(band, Action::Db(write, data));
                    }
                    Step::Grabbing | Step::Downloading => {
                        if step == Step::Grabbing && write.is_grab() {
                            // The DB-Manager still has to consume the grabber
                            // metadata; make the next grabber wait for it.
                            data.set_wait(true);
                        }
                        targets
                            .db
                            .push(band, Action::Db(write, Arc::clone(&data)));
                        let stage = if step == Step::Grabbing {
                            &targets.grabber
                        } else {
                            &targets.downloader
                        };
                        stage.push(band, Action::Db(write, data));
                    }
                    Step::Ending => {
                        targets.db.push(band, Action::Db(DbWrite::End, data));
                    }
                }
            }

            other => {
                debug!("dispatcher ignoring {other:?}");
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filedata::{FileData, OdKind};

    fn targets() -> Targets {
        Targets {
            db: Arc::new(Fifo::new()),
            parser: Arc::new(Fifo::new()),
            grabber: Arc::new(Fifo::new()),
            downloader: Arc::new(Fifo::new()),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(CancellationToken::new())
    }

    #[test]
    fn test_parsing_step_goes_to_parser_only() {
        let d = dispatcher();
        let t = targets();
        d.run(t.clone()).unwrap();

        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Parsing,
        );
        d.send(Band::Normal, Action::Db(DbWrite::InsertParser, data));

        match t.parser.pop() {
            Action::Db(DbWrite::InsertParser, data) => {
                assert_eq!(data.step(), Step::Parsing)
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(t.db.is_empty());
        d.stop();
    }

    #[test]
    fn test_grabbing_step_fans_out_and_arms_wait() {
        let d = dispatcher();
        let t = targets();
        d.run(t.clone()).unwrap();

        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Parsing,
        );
        data.step_increase(DbWrite::InsertParser); // -> Grabbing
        assert!(!data.wait_flag());

        d.send(
            Band::Normal,
            Action::Db(DbWrite::InsertGrabber, Arc::clone(&data)),
        );

        match t.db.pop() {
            Action::Db(DbWrite::InsertGrabber, _) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match t.grabber.pop() {
            Action::Db(DbWrite::InsertGrabber, data) => assert!(data.wait_flag()),
            other => panic!("unexpected: {other:?}"),
        }
        d.stop();
    }

    #[test]
    fn test_parser_write_in_grabbing_step_does_not_arm_wait() {
        let d = dispatcher();
        let t = targets();
        d.run(t.clone()).unwrap();

        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Parsing,
        );
        data.step_increase(DbWrite::InsertParser); // -> Grabbing

        d.send(
            Band::Normal,
            Action::Db(DbWrite::InsertParser, Arc::clone(&data)),
        );
        match t.grabber.pop() {
            Action::Db(DbWrite::InsertParser, data) => assert!(!data.wait_flag()),
            other => panic!("unexpected: {other:?}"),
        }
        d.stop();
    }

    #[test]
    fn test_ending_step_rewrites_to_end() {
        let d = dispatcher();
        let t = targets();
        d.run(t.clone()).unwrap();

        let data = FileData::new(
            "/m/a.mp3", 0, 0, false, OdKind::Scan, Band::Normal, Step::Parsing,
        );
        data.step_increase(DbWrite::InsertParser);
        data.step_increase(DbWrite::InsertParser);
        data.step_increase(DbWrite::InsertGrabber);
        assert_eq!(data.step(), Step::Ending);

        d.send(Band::Normal, Action::Db(DbWrite::InsertGrabber, data));
        match t.db.pop() {
            Action::Db(DbWrite::End, _) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(t.downloader.is_empty());
        d.stop();
    }

    #[test]
    fn test_next_loop_forwarded_to_grabber() {
        let d = dispatcher();
        let t = targets();
        d.run(t.clone()).unwrap();
        d.send(Band::Normal, Action::NextLoop);
        match t.grabber.pop() {
            Action::NextLoop => {}
            other => panic!("unexpected: {other:?}"),
        }
        d.stop();
    }
}
