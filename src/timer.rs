//! The timer queue.
//!
//! A thread-safe min-heap of deadlines dispatched by a dedicated worker.
//! Each timer is identified by a caller-chosen handle; rescheduling a
//! handle cancels its previous deadline. Cancellation is cheap: the handle
//! map records a generation per handle and stale heap entries are skipped
//! when popped, so nothing is ever removed from the middle of the heap.
//!
//! Expired timers fire serially, in deadline order with ties broken by
//! insertion order. Handlers that can block must off-load their own work;
//! a slow handler delays every later timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{MonoClock, MonoTime};

struct Entry<K> {
    deadline: MonoTime,
    gen: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.gen == other.gen
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Generation is globally monotonic, so equal deadlines order by
        // insertion.
        (self.deadline, self.gen).cmp(&(other.deadline, other.gen))
    }
}

struct State<K> {
    heap: BinaryHeap<Reverse<Entry<K>>>,
    live: HashMap<K, u64>,
    next_gen: u64,
    done: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    cond: Condvar,
}

/// A timer queue dispatching handles of type `K`.
pub struct TimerQueue<K: Copy + Eq + Hash + Send + 'static> {
    shared: Arc<Shared<K>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K: Copy + Eq + Hash + Send + 'static> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash + Send + 'static> TimerQueue<K> {
    /// Create a stopped timer queue.
    pub fn new() -> TimerQueue<K> {
        TimerQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    live: HashMap::new(),
                    next_gen: 0,
                    done: false,
                }),
                cond: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the dispatch worker.
    ///
    /// `dispatch` is invoked once per expiry, serially, on the worker
    /// thread.
    pub fn start<F>(&self, dispatch: F)
    where
        F: Fn(K) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name("timer-queue".into())
                .spawn(move || run_worker(shared, dispatch))
                .expect("spawn timer worker"),
        );
    }

    /// Schedule `key` to fire after `delay`.
    ///
    /// Re-entrant: an already-scheduled `key` is moved to the new deadline.
    pub fn schedule(&self, key: K, delay: Duration) {
        self.schedule_at(key, MonoClock::now() + delay);
    }

    /// Schedule `key` to fire at `deadline`.
    pub fn schedule_at(&self, key: K, deadline: MonoTime) {
        let mut state = self.shared.state.lock();
        let gen = state.next_gen;
        state.next_gen += 1;
        state.live.insert(key, gen);
        state.heap.push(Reverse(Entry { deadline, gen, key }));
        drop(state);
        self.cond_notify();
    }

    /// Cancel `key` if it is scheduled.
    pub fn cancel(&self, key: K) {
        self.shared.state.lock().live.remove(&key);
    }

    /// True if `key` is scheduled and has not yet fired.
    pub fn running(&self, key: K) -> bool {
        self.shared.state.lock().live.contains_key(&key)
    }

    /// Stop the worker; pending timers are discarded.
    pub fn stop(&self) {
        self.shared.state.lock().done = true;
        self.cond_notify();

        if let Some(handle) = self.worker.lock().take() {
            // A handler can drop the last owner of this queue; the worker
            // must not try to join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn cond_notify(&self) {
        self.shared.cond.notify_all();
    }
}

impl<K: Copy + Eq + Hash + Send + 'static> Drop for TimerQueue<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<K, F>(shared: Arc<Shared<K>>, dispatch: F)
where
    K: Copy + Eq + Hash + Send + 'static,
    F: Fn(K),
{
    let mut state = shared.state.lock();

    loop {
        if state.done {
            return;
        }

        let now = MonoClock::now();

        // Fire everything due, skipping stale generations
        loop {
            let due = matches!(state.heap.peek(), Some(Reverse(top)) if top.deadline <= now);
            if !due {
                break;
            }

            let Reverse(entry) = state.heap.pop().expect("peeked entry");
            let live = state.live.get(&entry.key) == Some(&entry.gen);
            if !live {
                continue;
            }
            state.live.remove(&entry.key);

            // Dispatch outside the lock so handlers can (re)schedule
            drop(state);
            dispatch(entry.key);
            state = shared.state.lock();

            if state.done {
                return;
            }
        }

        let next = state.heap.peek().map(|Reverse(top)| top.deadline);
        match next {
            None => {
                shared.cond.wait(&mut state);
            }
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(MonoClock::now());
                if !wait.is_zero() {
                    shared.cond.wait_for(&mut state, wait);
                }
            }
        }
    }
}
