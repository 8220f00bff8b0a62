//! One-shot resettable timers driven by a single background thread.
//!
//! Armed timers sit in an ordered set keyed by `(deadline, id)`. Resetting a
//! timer moves its one queued entry; stopping or dropping it removes the
//! entry, so the queue never holds more than one entry per live timer.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    /// Set while armed; mirrors this timer's key in `queue`.
    deadline: Option<Instant>,
    callback: Callback,
}

#[derive(Default)]
struct TimerState {
    queue: BTreeSet<(Instant, u64)>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
    shutdown: bool,
}

impl TimerState {
    fn disarm(&mut self, id: u64) -> bool {
        let Some(deadline) = self.entries.get_mut(&id).and_then(|e| e.deadline.take()) else {
            return false;
        };
        self.queue.remove(&(deadline, id));
        true
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Owner of the timer thread. Dropping it stops the thread; outstanding
/// [`Timer`]s then never fire.
pub(crate) struct TimerService {
    shared: Arc<TimerShared>,
}

/// Cheap handle used to create timers on a running service.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerService {
    pub(crate) fn spawn(name: &str) -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker))?;
        Ok(Self { shared })
    }

    pub(crate) fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
    }
}

fn run(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let Some(&(when, id)) = state.queue.first() else {
            shared.wake.wait(&mut state);
            continue;
        };
        if when > Instant::now() {
            shared.wake.wait_until(&mut state, when);
            continue;
        }
        state.queue.pop_first();
        let Some(entry) = state.entries.get_mut(&id) else {
            continue;
        };
        entry.deadline = None;
        let callback = entry.callback.clone();
        // Callbacks take connection locks, which in turn reset timers.
        drop(state);
        callback();
        state = shared.state.lock();
    }
}

impl TimerHandle {
    /// Registers a disarmed timer.
    pub(crate) fn timer<F>(&self, callback: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                deadline: None,
                callback: Arc::new(callback),
            },
        );
        Timer {
            id,
            shared: self.shared.clone(),
        }
    }
}

/// A one-shot timer. Dropping it cancels any pending fire.
pub(crate) struct Timer {
    id: u64,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Cancels any pending fire and arms the timer to fire after `after`.
    pub(crate) fn reset(&self, after: Duration) {
        let when = Instant::now() + after;
        let mut state = self.shared.state.lock();
        if !state.entries.contains_key(&self.id) {
            return;
        }
        state.disarm(self.id);
        if let Some(entry) = state.entries.get_mut(&self.id) {
            entry.deadline = Some(when);
        }
        state.queue.insert((when, self.id));
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Disarms the timer. Returns whether a fire was pending.
    pub(crate) fn stop(&self) -> bool {
        self.shared.state.lock().disarm(self.id)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.disarm(self.id);
        state.entries.remove(&self.id);
    }
}

/// `average ± plus_minus`, uniformly distributed.
pub(crate) fn jitter(average: Duration, plus_minus: Duration) -> Duration {
    use rand::Rng;
    let spread = plus_minus.as_nanos() as u64 * 2;
    let offset = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..spread)
    };
    average.saturating_sub(plus_minus) + Duration::from_nanos(offset)
}
