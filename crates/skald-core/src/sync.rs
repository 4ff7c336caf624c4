//! Small synchronisation primitives shared by the pipeline stages.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

fn relock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Counting semaphore.
///
/// Backs the per-file grabber gate and the stage pause handshake.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = relock(&self.count);
        *count += 1;
        drop(count);
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = relock(&self.count);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pause barrier for one stage.
///
/// The controller requests quiescence by queueing one pause action per worker
/// and calling [`PauseGate::toggle`]; each worker answers the action with
/// [`PauseGate::worker_pause`], which signals arrival and blocks until the
/// controller toggles again. The on-demand component is the only controller.
pub struct PauseGate {
    pausing: Semaphore,
    resume: Semaphore,
    paused: Mutex<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            pausing: Semaphore::new(),
            resume: Semaphore::new(),
            paused: Mutex::new(false),
        }
    }

    /// Worker side: acknowledge the pause and block until resumed.
    pub fn worker_pause(&self) {
        self.pausing.post();
        self.resume.wait();
    }

    /// Controller side. When the stage runs, `push_pause` must enqueue one
    /// pause action per worker; the call returns once all `workers` have
    /// acknowledged. When the stage is already paused, releases it instead.
    pub fn toggle(&self, workers: usize, push_pause: impl Fn()) {
        let mut paused = relock(&self.paused);
        if *paused {
            for _ in 0..workers {
                self.resume.post();
            }
            *paused = false;
        } else {
            for _ in 0..workers {
                push_pause();
            }
            for _ in 0..workers {
                self.pausing.wait();
            }
            *paused = true;
        }
    }

    /// Hard-stop path: release paused workers so they can observe the stop
    /// flag and exit.
    pub fn force_resume(&self, workers: usize) {
        let mut paused = relock(&self.paused);
        if *paused {
            for _ in 0..workers {
                self.resume.post();
            }
            *paused = false;
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Interruptible sleep for the scanner's inter-loop wait.
pub struct SleepTimer {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl SleepTimer {
    pub fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Sleep for `dur`, returning early when [`SleepTimer::wakeup`] fires.
    pub fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        let mut woken = relock(&self.woken);
        loop {
            if *woken {
                *woken = false;
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(woken, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            woken = guard;
        }
    }

    /// Interrupt a sleeping caller; a pending wakeup is consumed by the next
    /// `sleep`.
    pub fn wakeup(&self) {
        let mut woken = relock(&self.woken);
        *woken = true;
        drop(woken);
        self.cond.notify_all();
    }
}

impl Default for SleepTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_semaphore_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new());
        let poster = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            poster.post();
        });
        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_timer_wakeup_cuts_sleep_short() {
        let timer = Arc::new(SleepTimer::new());
        let waker = Arc::clone(&timer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wakeup();
        });
        let start = Instant::now();
        timer.sleep(Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_pause_gate_round_trip() {
        let gate = Arc::new(PauseGate::new());
        let worker_gate = Arc::clone(&gate);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            // Simulates a worker that polls its queue for a pause action.
            rx.recv().unwrap();
            worker_gate.worker_pause();
        });

        gate.toggle(1, || tx.send(()).unwrap()); // pause
        gate.toggle(1, || ());                   // resume
        handle.join().unwrap();
    }
}
