//! Deadline-ordered background job runner (C11).
//!
//! Generalizes the teacher's worker-thread-plus-control-channel shape
//! (`engine/scheduler.rs`, `player.rs`) into a reusable primitive: instead of
//! a single flattened, pre-sorted event list played out by one thread, this
//! accepts jobs at arbitrary times and always wakes for the nearest deadline.
//! The dispatcher uses it to schedule delayed history cleanup; the timing
//! plugin uses it to schedule buffer eviction.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

/// Below this remaining duration we stop waiting on the condvar (which can
/// overshoot by a native OS tick) and spin-sleep instead, the same precision
/// trade the teacher's `player.rs` makes for its scheduled note timing.
const SPIN_THRESHOLD: Duration = Duration::from_millis(10);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledJob {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledJob {}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap (a max-heap) pops the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<ScheduledJob>>,
    cond: Condvar,
    next_seq: Mutex<u64>,
    shutdown: Mutex<bool>,
}

/// A background thread that runs arbitrary closures at scheduled deadlines,
/// woken only when the earliest pending deadline changes.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            next_seq: Mutex::new(0),
            shutdown: Mutex::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || Self::run(worker_shared));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let mut heap = shared.heap.lock().unwrap();
            loop {
                if *shared.shutdown.lock().unwrap() {
                    return;
                }

                match heap.peek() {
                    None => {
                        heap = shared.cond.wait(heap).unwrap();
                    }
                    Some(top) => {
                        let now = Instant::now();
                        if top.deadline <= now {
                            break;
                        }
                        let wait_for = top.deadline - now;

                        if wait_for <= SPIN_THRESHOLD {
                            drop(heap);
                            let sleeper =
                                SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
                            sleeper.sleep(wait_for);
                            heap = shared.heap.lock().unwrap();
                            break;
                        }

                        let (guard, timeout) =
                            shared.cond.wait_timeout(heap, wait_for - SPIN_THRESHOLD).unwrap();
                        heap = guard;
                        if timeout.timed_out() {
                            // falls through to the next loop iteration, where the
                            // remaining wait is within SPIN_THRESHOLD
                        }
                    }
                }
            }

            let due = heap.pop();
            drop(heap);

            if let Some(scheduled) = due {
                debug!("scheduler: running job scheduled for {:?}", scheduled.deadline);
                (scheduled.job)();
            }
        }
    }

    /// Runs `job` once, after at least `delay` has elapsed.
    pub fn schedule_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let seq = {
            let mut next = self.shared.next_seq.lock().unwrap();
            let seq = *next;
            *next += 1;
            seq
        };

        {
            let mut heap = self.shared.heap.lock().unwrap();
            heap.push(ScheduledJob {
                deadline,
                seq,
                job: Box::new(job),
            });
        }
        self.shared.cond.notify_one();
    }

    pub fn shutdown(&self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.cond.notify_one();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("scheduler worker thread panicked during shutdown");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_job_after_delay() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_after(Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1))
            .expect("job should have run");
    }

    #[test]
    fn runs_jobs_in_deadline_order_regardless_of_submission_order() {
        let scheduler = Scheduler::new();
        let (tx, rx) = mpsc::channel();

        let tx_late = tx.clone();
        scheduler.schedule_after(Duration::from_millis(40), move || {
            tx_late.send("late").unwrap();
        });
        scheduler.schedule_after(Duration::from_millis(5), move || {
            tx.send("early").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "late");
    }
}
