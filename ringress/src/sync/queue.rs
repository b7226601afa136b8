//! Single-consumer work queue with de-duplication.
//!
//! Event bursts collapse to at most one pending entry per key; the consumer
//! runs one reconciliation at a time, which keeps the routing model a
//! single-writer structure.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub key: String,
    /// Skippable entries only dampen logging; they are still executed.
    pub skippable: bool,
}

pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, key: &str) {
        self.push(Task {
            key: key.to_string(),
            skippable: false,
        });
    }

    pub fn enqueue_skippable(&self, key: &str) {
        self.push(Task {
            key: key.to_string(),
            skippable: true,
        });
    }

    fn push(&self, task: Task) {
        if self.is_shutting_down() {
            tracing::warn!("Queue has been shut down, failed to enqueue: {}", task.key);
            return;
        }

        let mut tasks = self.tasks.lock().expect("task queue poisoned");
        if let Some(pending) = tasks.iter_mut().find(|t| t.key == task.key) {
            // merge duplicates, a non-skippable enqueue upgrades the entry
            pending.skippable = pending.skippable && task.skippable;
        } else {
            tasks.push_back(task);
        }
        drop(tasks);
        self.notify.notify_one();
    }

    /// Refuses new work; already queued tasks are drained by the consumer.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn pop(&self) -> Option<Task> {
        self.tasks.lock().expect("task queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes tasks one at a time until the stop channel fires. A failed
    /// task is logged and re-queued; the sync rate limiter paces retries.
    pub async fn run<F, Fut>(&self, period: Duration, mut stop: watch::Receiver<bool>, f: F)
    where
        F: Fn(Task) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            while let Some(task) = self.pop() {
                let key = task.key.clone();
                let skippable = task.skippable;
                if let Err(e) = f(task).await {
                    tracing::warn!("Error syncing {}, requeuing: {:#}", key, e);
                    if !self.is_shutting_down() {
                        self.push(Task {
                            key,
                            skippable: true,
                        });
                        break;
                    }
                } else if !skippable {
                    tracing::debug!("Synced {}", key);
                }
            }

            if self.is_shutting_down() && self.is_empty() {
                return;
            }

            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep(period) => {},
                _ = stop.changed() => return,
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn merges_duplicate_keys() {
        let queue = TaskQueue::new();
        queue.enqueue("a/b");
        queue.enqueue("a/b");
        queue.enqueue("c/d");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn non_skippable_upgrades_pending_entry() {
        let queue = TaskQueue::new();
        queue.enqueue_skippable("a/b");
        queue.enqueue("a/b");
        let task = queue.pop().unwrap();
        assert!(!task.skippable);
    }

    #[test]
    fn refuses_work_after_shutdown() {
        let queue = TaskQueue::new();
        queue.shutdown();
        queue.enqueue("a/b");
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn consumer_drains_in_order() {
        let queue = Arc::new(TaskQueue::new());
        queue.enqueue("first");
        queue.enqueue("second");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let consumer = {
            let queue = queue.clone();
            let seen = seen.clone();
            let count = count.clone();
            tokio::spawn(async move {
                queue
                    .run(Duration::from_millis(10), stop_rx, |task| {
                        let seen = seen.clone();
                        let count = count.clone();
                        async move {
                            seen.lock().unwrap().push(task.key);
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            })
        };

        while count.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(true).unwrap();
        consumer.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }
}
