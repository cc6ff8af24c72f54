//! Timer thread running deferred callbacks for pool maintenance

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;

use crate::connection::deadline_after;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Perturb `base` by a random fraction drawn from `[low_frac, high_frac]`.
///
/// # Examples
///
/// ```
/// let value = connpool::jitter(30.0, -0.1, 0.2);
/// assert!((27.0..=36.0).contains(&value));
/// ```
pub fn jitter(base: f64, low_frac: f64, high_frac: f64) -> f64 {
    let (low, high) = if low_frac <= high_frac {
        (low_frac, high_frac)
    } else {
        (high_frac, low_frac)
    };
    base + base * rand::thread_rng().gen_range(low..=high)
}

/// [`jitter`] applied to a duration, clamped to `[0, Duration::MAX]`.
pub fn jitter_duration(base: Duration, low_frac: f64, high_frac: f64) -> Duration {
    let secs = jitter(base.as_secs_f64(), low_frac, high_frac).max(0.0);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Handle returned by [`Scheduler::enter`], used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

enum Signal {
    Wake,
    Stop,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    stopped: bool,
}

impl Queue {
    /// Pop every live callback due at `now`, or report the next due time.
    fn take_due(&mut self, now: Instant) -> (Vec<Callback>, Option<Instant>) {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if !self.callbacks.contains_key(&id) {
                // cancelled
                self.heap.pop();
                continue;
            }
            if at > now {
                return (due, Some(at));
            }
            self.heap.pop();
            if let Some(cb) = self.callbacks.remove(&id) {
                due.push(cb);
            }
        }
        (due, None)
    }
}

/// A single thread executing callbacks no earlier than their due time.
///
/// Callbacks must be short: they run one after the other on the scheduler
/// thread. Pool maintenance callbacks only enqueue worker tasks.
pub(crate) struct Scheduler {
    queue: Arc<Mutex<Queue>>,
    signal: Sender<Signal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the scheduler thread.
    pub fn start(name: &str) -> std::io::Result<Self> {
        let queue = Arc::new(Mutex::new(Queue::default()));
        let (signal, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn({
                let queue = Arc::clone(&queue);
                move || run(queue, rx)
            })?;

        Ok(Self {
            queue,
            signal,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn enter(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.enter_at(deadline_after(Instant::now(), delay), callback)
    }

    pub fn enter_at(&self, due: Instant, callback: impl FnOnce() + Send + 'static) -> TaskHandle {
        let handle = {
            let mut queue = self.queue.lock();
            let id = queue.next_id;
            queue.next_id += 1;
            if !queue.stopped {
                queue.heap.push(Reverse((due, id)));
                queue.callbacks.insert(id, Box::new(callback));
            }
            TaskHandle(id)
        };
        let _ = self.signal.send(Signal::Wake);
        handle
    }

    /// Cancel a pending callback. Returns false if it already ran.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        self.queue.lock().callbacks.remove(&handle.0).is_some()
    }

    /// Number of pending callbacks
    pub fn len(&self) -> usize {
        self.queue.lock().callbacks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Drop all pending callbacks and ask the thread to exit. The returned
    /// handle (first call only) can be joined to wait for it.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        {
            let mut queue = self.queue.lock();
            queue.stopped = true;
            queue.heap.clear();
            queue.callbacks.clear();
        }
        let _ = self.signal.send(Signal::Stop);
        self.thread.lock().take()
    }
}

fn run(queue: Arc<Mutex<Queue>>, rx: Receiver<Signal>) {
    tracing::debug!("scheduler started");
    loop {
        let (due, next) = {
            let mut queue = queue.lock();
            if queue.stopped {
                break;
            }
            queue.take_due(Instant::now())
        };

        if !due.is_empty() {
            for callback in due {
                if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    tracing::error!("scheduled task panicked");
                }
            }
            continue;
        }

        let signal = match next {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match signal {
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
    }
    tracing::debug!("scheduler stopped");
}
