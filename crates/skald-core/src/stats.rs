//! Runtime statistics registry.
//!
//! Components register a named group and attach counters and timers to it.
//! A group may also register a dump closure used for periodic human-readable
//! reporting through the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn item_id(name: &str, sub: Option<&str>) -> String {
    match sub {
        Some(sub) => format!("{name}:{sub}"),
        None => name.to_string(),
    }
}

/// Monotonic counter.
pub struct Counter {
    id: String,
    count: AtomicU64,
}

impl Counter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Accumulating wall-clock timer; `start`/`stop` must be called in pairs.
pub struct Timer {
    id: String,
    elapsed_ns: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl Timer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) {
        let mut started = relock(&self.started);
        *started = Some(Instant::now());
    }

    pub fn stop(&self) {
        let mut started = relock(&self.started);
        if let Some(begin) = started.take() {
            let ns = begin.elapsed().as_nanos() as u64;
            self.elapsed_ns.fetch_add(ns, Ordering::Relaxed);
        }
    }

    /// Total accumulated time in nanoseconds.
    pub fn read_ns(&self) -> u64 {
        self.elapsed_ns.load(Ordering::Relaxed)
    }

    /// Total accumulated time in seconds.
    pub fn read_secs(&self) -> f64 {
        self.read_ns() as f64 / 1_000_000_000.0
    }
}

type DumpFn = Box<dyn Fn() + Send + Sync>;

struct Group {
    id: String,
    counters: Mutex<Vec<Arc<Counter>>>,
    timers: Mutex<Vec<Arc<Timer>>>,
    dump: Mutex<Option<DumpFn>>,
}

/// Statistics registry shared by all components of one handle.
pub struct Stats {
    groups: Mutex<Vec<Arc<Group>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
        }
    }

    fn group(&self, id: &str) -> Arc<Group> {
        let mut groups = relock(&self.groups);
        if let Some(grp) = groups.iter().find(|g| g.id == id) {
            return Arc::clone(grp);
        }
        let grp = Arc::new(Group {
            id: id.to_string(),
            counters: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            dump: Mutex::new(None),
        });
        groups.push(Arc::clone(&grp));
        grp
    }

    /// Register a group (idempotent) and attach its dump closure.
    pub fn group_add(&self, id: &str, dump: Option<DumpFn>) {
        let grp = self.group(id);
        let mut slot = relock(&grp.dump);
        if let Some(dump) = dump {
            *slot = Some(dump);
        }
    }

    /// Get or create a counter in `group`.
    pub fn counter(&self, group: &str, name: &str, sub: Option<&str>) -> Arc<Counter> {
        let grp = self.group(group);
        let id = item_id(name, sub);
        let mut counters = relock(&grp.counters);
        if let Some(cnt) = counters.iter().find(|c| c.id == id) {
            return Arc::clone(cnt);
        }
        let cnt = Arc::new(Counter {
            id,
            count: AtomicU64::new(0),
        });
        counters.push(Arc::clone(&cnt));
        cnt
    }

    /// Get or create a timer in `group`.
    pub fn timer(&self, group: &str, name: &str, sub: Option<&str>) -> Arc<Timer> {
        let grp = self.group(group);
        let id = item_id(name, sub);
        let mut timers = relock(&grp.timers);
        if let Some(tmr) = timers.iter().find(|t| t.id == id) {
            return Arc::clone(tmr);
        }
        let tmr = Arc::new(Timer {
            id,
            elapsed_ns: AtomicU64::new(0),
            started: Mutex::new(None),
        });
        timers.push(Arc::clone(&tmr));
        tmr
    }

    /// Run the dump closure of one group, or of all groups.
    pub fn dump(&self, group: Option<&str>) {
        let groups: Vec<Arc<Group>> = {
            let guard = relock(&self.groups);
            guard
                .iter()
                .filter(|g| group.is_none_or(|id| g.id == id))
                .map(Arc::clone)
                .collect()
        };
        for grp in groups {
            let dump = relock(&grp.dump);
            if let Some(dump) = dump.as_ref() {
                dump();
            }
        }
    }

    /// Names of all registered groups.
    pub fn group_names(&self) -> Vec<String> {
        relock(&self.groups).iter().map(|g| g.id.clone()).collect()
    }

    /// Snapshot of `(id, value)` for every counter of `group`.
    pub fn counters(&self, group: &str) -> Vec<(String, u64)> {
        let grp = self.group(group);
        let counters = relock(&grp.counters);
        counters.iter().map(|c| (c.id.clone(), c.read())).collect()
    }

    /// Snapshot of `(id, nanoseconds)` for every timer of `group`.
    pub fn timers(&self, group: &str) -> Vec<(String, u64)> {
        let grp = self.group(group);
        let timers = relock(&grp.timers);
        timers.iter().map(|t| (t.id.clone(), t.read_ns())).collect()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
