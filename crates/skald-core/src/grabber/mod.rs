//! Grabber stage: a pool of workers running metadata plugins.
//!
//! All workers share one registry of plugins. A plugin runs at most once at a
//! time globally (its own mutex guarantees that); selection walks the chain
//! twice — full speed first, then with a spaced retry — and gives the file
//! back to the dispatcher when every compatible plugin is busy, so one slow
//! plugin cannot monopolise the pool.

mod dummy;
mod local;
mod tmdb;

pub use dummy::DummyGrabber;
pub use local::LocalGrabber;
pub use tmdb::TmdbGrabber;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{GrabberConfig, MetaPriority, PipelineConfig};
use crate::error::{Result, SkaldError};
use crate::fifo::{Band, Fifo};
use crate::filedata::{Action, FileData, FileType};
use crate::meta::PriorityList;
use crate::net::HttpClient;
use crate::stats::{Counter, Stats, Timer};
use crate::sync::PauseGate;

const STATS_GROUP: &str = "grabber";

/// File kinds a plugin can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    bits: u8,
}

impl Caps {
    pub const AUDIO: Caps = Caps { bits: 1 };
    pub const VIDEO: Caps = Caps { bits: 2 };
    pub const IMAGE: Caps = Caps { bits: 4 };

    pub const fn union(self, other: Caps) -> Caps {
        Caps {
            bits: self.bits | other.bits,
        }
    }

    /// An unclassified file is offered to every plugin.
    pub fn supports(self, ty: FileType) -> bool {
        match ty {
            FileType::Null => true,
            FileType::Audio => self.bits & Caps::AUDIO.bits != 0,
            FileType::Video => self.bits & Caps::VIDEO.bits != 0,
            FileType::Image => self.bits & Caps::IMAGE.bits != 0,
            FileType::Playlist => false,
        }
    }
}

/// Resources handed to a plugin at init time.
pub struct GrabberParams {
    pub http: Arc<HttpClient>,
}

/// A metadata plugin.
///
/// `grab` may only touch the grabber metadata and the download list of the
/// record; everything else is read-only from its point of view. Downloads
/// must be queued, never performed, so the downloader stage can batch and
/// resume them.
pub trait Grabber: Send {
    fn name(&self) -> &'static str;
    fn caps(&self) -> Caps;

    /// Default priorities for the metadata this plugin produces.
    fn priorities(&self) -> PriorityList {
        PriorityList::default()
    }

    /// Minimum pause between two `grab` calls of this plugin.
    fn timewait(&self) -> Duration {
        Duration::ZERO
    }

    fn init(&mut self, _params: &GrabberParams) -> Result<()> {
        Ok(())
    }

    fn uninit(&mut self) {}

    fn grab(&mut self, data: &FileData, pl: &PriorityList) -> Result<()>;

    /// Called between two scanner loops.
    fn on_loop(&mut self) {}
}

struct SlotInner {
    grabber: Box<dyn Grabber>,
    priorities: PriorityList,
}

struct SlotStats {
    timer: Arc<Timer>,
    success: Arc<Counter>,
    failure: Arc<Counter>,
    skip: Arc<Counter>,
}

/// One registered plugin with its mutex and bookkeeping.
struct Slot {
    name: &'static str,
    caps: Caps,
    timewait: Duration,
    enabled: AtomicBool,
    inner: Mutex<SlotInner>,
    last_grab: Mutex<Option<Instant>>,
    stats: OnceLock<SlotStats>,
}

impl Slot {
    fn new(grabber: Box<dyn Grabber>) -> Arc<Self> {
        let priorities = grabber.priorities();
        Arc::new(Self {
            name: grabber.name(),
            caps: grabber.caps(),
            timewait: grabber.timewait(),
            enabled: AtomicBool::new(true),
            inner: Mutex::new(SlotInner {
                grabber,
                priorities,
            }),
            last_grab: Mutex::new(None),
            stats: OnceLock::new(),
        })
    }

    fn eligible(&self, data: &FileData) -> bool {
        self.enabled.load(Ordering::SeqCst)
            && self.caps.supports(data.file_type())
            && !data.grabber_done(self.name)
            && self.cooled_down()
    }

    fn cooled_down(&self) -> bool {
        if self.timewait.is_zero() {
            return true;
        }
        let last = self.last_grab.lock().unwrap_or_else(|e| e.into_inner());
        last.map(|t| t.elapsed() >= self.timewait).unwrap_or(true)
    }
}

pub struct GrabberPool {
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    nb: usize,
    slots: Arc<Mutex<Vec<Arc<Slot>>>>,
    stats: Arc<Stats>,
    http: Arc<HttpClient>,
    /// Per-worker record of the file a worker is gated on, so a hard stop
    /// can post the gate.
    waiting: Arc<Vec<Mutex<Option<Arc<FileData>>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl GrabberPool {
    pub fn new(
        nb: usize,
        stats: Arc<Stats>,
        http: Arc<HttpClient>,
        cancel: CancellationToken,
    ) -> Self {
        let nb = nb.clamp(1, PipelineConfig::GRABBER_THREADS_MAX);
        let slots: Arc<Mutex<Vec<Arc<Slot>>>> = Arc::new(Mutex::new(Vec::new()));

        let dump_slots = Arc::clone(&slots);
        stats.group_add(
            STATS_GROUP,
            Some(Box::new(move || dump_stats(&dump_slots))),
        );

        Self {
            fifo: Arc::new(Fifo::new()),
            gate: Arc::new(PauseGate::new()),
            cancel,
            nb,
            slots,
            stats,
            http,
            waiting: Arc::new((0..nb).map(|_| Mutex::new(None)).collect()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn fifo(&self) -> Arc<Fifo<Action>> {
        Arc::clone(&self.fifo)
    }

    pub fn workers(&self) -> usize {
        self.nb
    }

    /// Register one plugin. The first registered is the favourite: selection
    /// walks the chain in registration order.
    pub fn register(&self, grabber: Box<dyn Grabber>) {
        let slot = Slot::new(grabber);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.iter().any(|s| s.name == slot.name) {
            warn!(name = slot.name, "grabber already registered");
            return;
        }
        slots.push(slot);
    }

    pub fn grabber_names(&self) -> Vec<&'static str> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().map(|s| s.name).collect()
    }

    pub fn state_set(&self, name: &str, enabled: bool) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.iter().find(|s| s.name == name) {
            slot.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// Adjust the priority list of one grabber, or of all grabbers when
    /// `name` is `None`.
    pub fn priority_set(&self, name: Option<&str>, meta: Option<&str>, prio: MetaPriority) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter() {
            if name.is_some_and(|n| n != slot.name) {
                continue;
            }
            let mut inner = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.priorities.set(meta, prio);
            if name.is_some() {
                break;
            }
        }
    }

    pub fn priority_read(&self, name: &str, meta: &str) -> Option<MetaPriority> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.iter().find(|s| s.name == name)?;
        let inner = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
        Some(inner.priorities.get(meta))
    }

    /// Initialise every plugin and attach its statistics items. A failing
    /// plugin init is fatal to the whole run.
    fn init_plugins(&self) -> Result<()> {
        let params = GrabberParams {
            http: Arc::clone(&self.http),
        };
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter() {
            {
                let mut inner = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.grabber.init(&params)?;
            }
            let _ = slot.stats.set(SlotStats {
                timer: self.stats.timer(STATS_GROUP, slot.name, None),
                success: self.stats.counter(STATS_GROUP, slot.name, Some("success")),
                failure: self.stats.counter(STATS_GROUP, slot.name, Some("failure")),
                skip: self.stats.counter(STATS_GROUP, slot.name, Some("skip")),
            });
        }
        Ok(())
    }

    /// Release plugin resources; called once the pool is stopped for good.
    pub fn uninit_plugins(&self) {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for slot in slots.iter() {
            let mut inner = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.grabber.uninit();
        }
    }

    pub fn pause_toggle(&self) {
        let fifo = Arc::clone(&self.fifo);
        self.gate
            .toggle(self.nb, move || fifo.push(Band::High, Action::Pause));
    }

    pub fn run(&self, dispatcher: Arc<Fifo<Action>>) -> Result<()> {
        self.init_plugins()?;

        let slots = {
            let guard = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for id in 0..self.nb {
            let worker = Worker {
                id,
                fifo: Arc::clone(&self.fifo),
                gate: Arc::clone(&self.gate),
                cancel: self.cancel.clone(),
                dispatcher: Arc::clone(&dispatcher),
                slots: slots.clone(),
                stats: Arc::clone(&self.stats),
                waiting: Arc::clone(&self.waiting),
            };
            let handle = std::thread::Builder::new()
                .name(format!("skald-grabber-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| SkaldError::Thread(e.to_string()))?;
            threads.push(handle);
        }
        Ok(())
    }

    pub fn stop(&self) {
        let handles: Vec<_> = {
            let mut slot = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            slot.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        for _ in &handles {
            self.fifo.push(Band::High, Action::Kill);
        }
        self.gate.force_resume(self.nb);
        // Wake up any worker gated on a record the DB-Manager will never
        // drain now.
        for waiting in self.waiting.iter() {
            let guard = waiting.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(data) = guard.as_ref() {
                data.gate_post();
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("grabber worker panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    fifo: Arc<Fifo<Action>>,
    gate: Arc<PauseGate>,
    cancel: CancellationToken,
    dispatcher: Arc<Fifo<Action>>,
    slots: Vec<Arc<Slot>>,
    stats: Arc<Stats>,
    waiting: Arc<Vec<Mutex<Option<Arc<FileData>>>>>,
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

                Action::NextLoop => {
                    for slot in &self.slots {
                        let mut inner = slot.inner.lock().unwrap_or_else(|e| e.into_inner());
                        inner.grabber.on_loop();
                    }
                    self.stats.dump(Some(STATS_GROUP));
                }

                Action::Db(write, data) => {
                    if data.wait_flag() {
                        // The DB-Manager still owns the previous grabber
                        // metadata of this record; wait until it posted the
                        // gate. The record is published so a hard stop can
                        // post it for us.
                        {
                            let mut slot = self.waiting[self.id]
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            *slot = Some(Arc::clone(&data));
                        }
                        data.gate_wait();
                        data.set_wait(false);
                        {
                            let mut slot = self.waiting[self.id]
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            *slot = None;
                        }
                        if self.cancel.is_cancelled() {
                            break;
                        }
                    }

                    self.grab_one(&data);

                    let remaining = self.slots.iter().any(|s| s.eligible(&data));
                    let write = if remaining {
                        data.step_continue(write)
                    } else {
                        data.step_increase(write)
                    };
                    debug!(
                        path = %data.path().display(),
                        remaining, "grabbing round finished"
                    );
                    let band = data.band();
                    self.dispatcher.push(band, Action::Db(write, data));
                }

                other => debug!("grabber ignoring {other:?}"),
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
    }

    /// Run the first available compatible plugin on `data`. Two passes over
    /// the chain: try-locks first, then one spaced retry per plugin; when
    /// both fail the file is marked skipped and simply requeued.
    fn grab_one(&self, data: &Arc<FileData>) {
        data.set_skip(false);
        for pass in 0..2 {
            for slot in &self.slots {
                if !slot.eligible(data) {
                    continue;
                }
                if pass == 1 {
                    std::thread::sleep(GrabberConfig::LOCK_RETRY_WAIT);
                }
                let mut inner = match slot.inner.try_lock() {
                    Ok(inner) => inner,
                    Err(TryLockError::Poisoned(e)) => e.into_inner(),
                    Err(TryLockError::WouldBlock) => continue,
                };

                data.set_grabber_name(Some(slot.name));
                let SlotInner {
                    grabber,
                    priorities,
                } = &mut *inner;

                let stats = slot.stats.get();
                if let Some(s) = stats {
                    s.timer.start();
                }
                let result = grabber.grab(data, priorities);
                if let Some(s) = stats {
                    s.timer.stop();
                }
                {
                    let mut last = slot.last_grab.lock().unwrap_or_else(|e| e.into_inner());
                    *last = Some(Instant::now());
                }

                match result {
                    Ok(()) => {
                        if let Some(s) = stats {
                            s.success.inc();
                        }
                    }
                    Err(e) => {
                        if let Some(s) = stats {
                            s.failure.inc();
                        }
                        debug!(
                            grabber = slot.name,
                            path = %data.path().display(),
                            "grabbing failed: {e}"
                        );
                    }
                }
                data.mark_grabber_done(slot.name);
                return;
            }
        }

        // Every compatible plugin is busy: give another file a chance.
        data.set_skip(true);
        for slot in &self.slots {
            if slot.eligible(data) {
                if let Some(s) = slot.stats.get() {
                    s.skip.inc();
                }
                break;
            }
        }
    }
}

fn dump_stats(slots: &Mutex<Vec<Arc<Slot>>>) {
    let slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    info!("statistics dump ({STATS_GROUP})");
    let mut success_all = 0u64;
    let mut total_all = 0u64;
    for slot in slots.iter() {
        let Some(stats) = slot.stats.get() else {
            continue;
        };
        let success = stats.success.read();
        let failure = stats.failure.read();
        let total = success + failure;
        let time = stats.timer.read_secs();
        success_all += success;
        total_all += total;
        info!(
            "{:<10} | {:>6}/{:<6} ({:6.2}%) {:7.2} sec {:7.2} sec/file",
            slot.name,
            success,
            total,
            if total > 0 {
                100.0 * success as f64 / total as f64
            } else {
                100.0
            },
            time,
            if total > 0 { time / total as f64 } else { 0.0 },
        );
    }
    info!(
        "{:<10} | {:>6}/{:<6} ({:6.2}%)",
        "GLOBAL",
        success_all,
        total_all,
        if total_all > 0 {
            100.0 * success_all as f64 / total_all as f64
        } else {
            100.0
        },
    );
}
