/*!
A single-threaded timer service.

One dedicated thread sleeps until the earliest deadline and runs the
callback. [`TimerHandle::cancel`] is synchronous: once it returns true the
callback will never run. Custody timers and reroute timers both live here.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    shared: std::sync::Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancels the timer. Returns true if the callback had not yet run.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock().expect("lock poisoned");
        state.callbacks.remove(&self.id).is_some()
    }
}

impl core::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });

        let run_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("timers".to_string())
            .spawn(move || run(run_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules `f` to run after `delay` on the timer thread.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock().expect("lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse((deadline, id)));
        state.callbacks.insert(id, Box::new(f));
        drop(state);
        self.cond_notify();
        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn cond_notify(&self) {
        self.shared.cond.notify_one();
    }

    /// Stops the timer thread; pending timers are dropped unfired.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.shutdown = true;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.lock().expect("lock poisoned").take() {
            let _ = thread.join();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().expect("lock poisoned");
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = state.heap.peek().copied() {
            if deadline > now {
                break;
            }
            state.heap.pop();
            // A missing callback means the timer was cancelled.
            if let Some(callback) = state.callbacks.remove(&id) {
                due.push(callback);
            }
        }

        if !due.is_empty() {
            // Callbacks run without the service lock held.
            drop(state);
            for callback in due {
                callback();
            }
            state = shared.state.lock().expect("lock poisoned");
            continue;
        }

        state = match state.heap.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(now);
                shared
                    .cond
                    .wait_timeout(state, wait)
                    .expect("lock poisoned")
                    .0
            }
            None => shared.cond.wait(state).expect("lock poisoned"),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_in_order() {
        let service = TimerService::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = counter.clone();
        service.schedule(Duration::from_millis(20), move || {
            c1.store(2, Ordering::SeqCst);
        });
        let c2 = counter.clone();
        service.schedule(Duration::from_millis(5), move || {
            c2.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_prevents_firing() {
        let service = TimerService::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let handle = service.schedule(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
