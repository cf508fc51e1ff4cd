//! Execution Queue: per-group FIFO with a global concurrency limit.
//!
//! Work submitted for one group runs strictly in submission order and never
//! overlaps. At most `max_concurrent` items run across all groups. Groups
//! with a runnable head wait in a round-robin ring, so a group that keeps
//! submitting goes to the back of the ring after each item and cannot starve
//! the others.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, warn};

/// A unit of work admitted by the queue.
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Execution queue is closed")]
    Closed,

    #[error("Work item panicked")]
    Panicked,

    #[error("Work item was dropped before it ran")]
    Cancelled,
}

/// Completion handle returned by [`ExecutionQueue::submit`].
#[derive(Debug)]
pub struct SubmitHandle {
    id: u64,
    done: oneshot::Receiver<Result<(), QueueError>>,
}

impl SubmitHandle {
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the item has finished running.
    pub async fn wait(self) -> Result<(), QueueError> {
        self.done.await.unwrap_or(Err(QueueError::Cancelled))
    }
}

struct Job {
    id: u64,
    work: Work,
    done: oneshot::Sender<Result<(), QueueError>>,
}

#[derive(Default)]
struct GroupQueue {
    pending: VecDeque<Job>,
    running: bool,
}

#[derive(Default)]
struct State {
    groups: HashMap<String, GroupQueue>,
    /// Groups whose head may start; each appears at most once.
    ready: VecDeque<String>,
    running: usize,
    next_id: u64,
    closed: bool,
}

struct Shared {
    max_concurrent: usize,
    state: Mutex<State>,
    idle: Notify,
}

/// Per-group FIFO scheduler with a global running limit.
#[derive(Clone)]
pub struct ExecutionQueue {
    shared: Arc<Shared>,
}

impl ExecutionQueue {
    /// Create a queue allowing `max_concurrent` simultaneous items (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// Append `work` to `group`'s FIFO and start whatever is now admissible.
    pub fn submit<F>(&self, group: &str, work: F) -> Result<SubmitHandle, QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.next_id += 1;
            let id = state.next_id;

            let entry = state.groups.entry(group.to_string()).or_default();
            let was_idle = entry.pending.is_empty() && !entry.running;
            entry.pending.push_back(Job {
                id,
                work: Box::pin(work),
                done: done_tx,
            });
            if was_idle {
                state.ready.push_back(group.to_string());
            }
            id
        };
        debug!(group, job = id, "Work submitted");

        self.pump();
        Ok(SubmitHandle { id, done: done_rx })
    }

    /// Items currently running across all groups.
    pub fn active_count(&self) -> usize {
        self.lock().running
    }

    pub fn is_running(&self, group: &str) -> bool {
        self.lock().groups.get(group).is_some_and(|g| g.running)
    }

    /// Items waiting (not running) in `group`'s FIFO.
    pub fn pending_count(&self, group: &str) -> usize {
        self.lock().groups.get(group).map_or(0, |g| g.pending.len())
    }

    /// Whether `group` has anything running or waiting.
    pub fn has_work(&self, group: &str) -> bool {
        self.lock().groups.contains_key(group)
    }

    /// Refuse new submissions and drop every item that has not started.
    ///
    /// Running items finish normally; dropped items resolve as cancelled.
    pub fn close(&self) -> usize {
        let dropped: Vec<Job> = {
            let mut state = self.lock();
            state.closed = true;
            state.ready.clear();
            let mut dropped = Vec::new();
            state.groups.retain(|_, g| {
                dropped.extend(g.pending.drain(..));
                g.running
            });
            dropped
        };
        let count = dropped.len();
        for job in dropped {
            let _ = job.done.send(Err(QueueError::Cancelled));
        }
        if count > 0 {
            warn!(count, "Dropped queued work on close");
        }
        self.shared.idle.notify_waiters();
        count
    }

    /// Wait until nothing is running and nothing is waiting.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn is_idle(&self) -> bool {
        let state = self.lock();
        state.running == 0 && state.groups.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start ready heads, round-robin, while global slots are free.
    fn pump(&self) {
        let mut starting = Vec::new();
        {
            let mut state = self.lock();
            while state.running < self.shared.max_concurrent {
                let Some(group) = state.ready.pop_front() else {
                    break;
                };
                let Some(entry) = state.groups.get_mut(&group) else {
                    continue;
                };
                let Some(job) = entry.pending.pop_front() else {
                    continue;
                };
                entry.running = true;
                state.running += 1;
                starting.push((group, job));
            }
        }

        for (group, job) in starting {
            self.start(group, job);
        }
    }

    fn start(&self, group: String, job: Job) {
        let queue = self.clone();
        let Job { id, work, done } = job;
        debug!(group = %group, job = id, "Work started");

        tokio::spawn(async move {
            // Inner task so a panic in `work` still releases the slot.
            let result = match tokio::spawn(work).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_panic() => {
                    error!(group = %group, job = id, "Work item panicked");
                    Err(QueueError::Panicked)
                }
                Err(_) => Err(QueueError::Cancelled),
            };
            queue.finish(&group);
            let _ = done.send(result);
        });
    }

    fn finish(&self, group: &str) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            let more = match state.groups.get_mut(group) {
                Some(entry) => {
                    entry.running = false;
                    !entry.pending.is_empty()
                }
                None => false,
            };
            if more {
                state.ready.push_back(group.to_string());
            } else {
                state.groups.remove(group);
            }
        }
        debug!(group, "Work finished");
        self.pump();
        self.shared.idle.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_group_runs_in_order_without_overlap() {
        let queue = ExecutionQueue::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            handles.push(
                queue
                    .submit("g", async move {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        log.lock().unwrap().push(i);
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn global_limit_is_respected() {
        let queue = ExecutionQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(
                queue
                    .submit(&format!("g{i}"), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(queue.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn panicking_item_does_not_block_its_group() {
        let queue = ExecutionQueue::new(1);
        let first = queue
            .submit("g", async { panic!("boom") })
            .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let second = queue
            .submit("g", async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(first.wait().await, Err(QueueError::Panicked));
        second.wait().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn busy_group_cannot_starve_others() {
        let queue = ExecutionQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = Arc::new(Notify::new());
        let gate2 = Arc::clone(&gate);
        let blocker = queue
            .submit("busy", async move { gate2.notified().await })
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            handles.push(
                queue
                    .submit("busy", async move { order.lock().unwrap().push(format!("busy{i}")) })
                    .unwrap(),
            );
        }
        let order2 = Arc::clone(&order);
        handles.push(
            queue
                .submit("quiet", async move { order2.lock().unwrap().push("quiet".to_string()) })
                .unwrap(),
        );

        gate.notify_one();
        blocker.wait().await.unwrap();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let order = order.lock().unwrap();
        let quiet_at = order.iter().position(|s| s == "quiet").unwrap();
        assert!(quiet_at <= 1, "quiet group waited behind busy: {order:?}");
    }

    #[tokio::test]
    async fn close_cancels_pending_and_rejects_new_work() {
        let queue = ExecutionQueue::new(1);
        let gate = Arc::new(Notify::new());
        let gate2 = Arc::clone(&gate);
        let running = queue
            .submit("a", async move { gate2.notified().await })
            .unwrap();
        let waiting = queue.submit("b", async {}).unwrap();
        assert_eq!(queue.pending_count("b"), 1);

        assert_eq!(queue.close(), 1);
        assert_eq!(waiting.wait().await, Err(QueueError::Cancelled));
        assert!(matches!(queue.submit("c", async {}), Err(QueueError::Closed)));

        gate.notify_one();
        running.wait().await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(1)).await);
    }
}
