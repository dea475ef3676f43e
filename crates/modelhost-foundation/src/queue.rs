//! Task queues shared between submitters and workers.
//!
//! Each entry carries the submitter's `oneshot` sender, so whoever consumes
//! or drops the entry resolves the waiting caller directly.

use modelhost_kernel::{ServiceError, TaskTiming, WorkerResult, WorkerTask};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::{Notify, futures::Notified, oneshot};

/// A task plus the channel its result is delivered on.
#[derive(Debug)]
pub struct QueuedTask {
    pub task: WorkerTask,
    responder: Option<oneshot::Sender<WorkerResult>>,
    pub enqueued_at: Instant,
}

impl QueuedTask {
    pub fn new(task: WorkerTask, responder: oneshot::Sender<WorkerResult>) -> Self {
        Self {
            task,
            responder: Some(responder),
            enqueued_at: Instant::now(),
        }
    }

    /// An entry nobody is waiting on (e.g. preload work).
    pub fn detached(task: WorkerTask) -> Self {
        Self {
            task,
            responder: None,
            enqueued_at: Instant::now(),
        }
    }

    /// Deliver the result. Returns false when the submitter stopped waiting.
    pub fn respond(mut self, result: WorkerResult) -> bool {
        match self.responder.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Resolve the submitter with `error` without running the task.
    ///
    /// Returns true when a live waiter was cancelled.
    pub fn fail(self, worker_id: &str, error: ServiceError) -> bool {
        let result = WorkerResult::failure(
            self.task.task_id.clone(),
            worker_id,
            error,
            TaskTiming::default(),
        );
        self.respond(result)
    }

    pub fn has_waiter(&self) -> bool {
        self.responder.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrdering {
    /// Strict arrival order.
    Fifo,
    /// Higher priority first, arrival order within a priority.
    Priority,
}

#[derive(Debug)]
pub struct TaskQueue {
    entries: Mutex<VecDeque<QueuedTask>>,
    notify: Notify,
    ordering: QueueOrdering,
}

impl TaskQueue {
    pub fn new(ordering: QueueOrdering) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            ordering,
        }
    }

    pub fn fifo() -> Self {
        Self::new(QueueOrdering::Fifo)
    }

    pub fn priority() -> Self {
        Self::new(QueueOrdering::Priority)
    }

    pub fn push(&self, entry: QueuedTask) {
        {
            let mut entries = self.entries.lock();
            match self.ordering {
                QueueOrdering::Fifo => entries.push_back(entry),
                QueueOrdering::Priority => {
                    let priority = entry.task.priority;
                    let at = entries
                        .iter()
                        .position(|queued| queued.task.priority < priority)
                        .unwrap_or(entries.len());
                    entries.insert(at, entry);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Put an entry back at the front, ahead of everything else.
    pub fn push_front(&self, entry: QueuedTask) {
        self.entries.lock().push_front(entry);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<QueuedTask> {
        self.entries.lock().pop_front()
    }

    /// Resolves after the next push (or immediately if a push was missed).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len_for_model(&self, model_id: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|queued| queued.task.model_id == model_id)
            .count()
    }

    /// Remove and return every entry matching `predicate`, preserving order.
    pub fn drain_where<F>(&self, mut predicate: F) -> Vec<QueuedTask>
    where
        F: FnMut(&QueuedTask) -> bool,
    {
        let mut entries = self.entries.lock();
        let mut kept = VecDeque::with_capacity(entries.len());
        let mut drained = Vec::new();
        for entry in entries.drain(..) {
            if predicate(&entry) {
                drained.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *entries = kept;
        drained
    }

    pub fn drain_all(&self) -> Vec<QueuedTask> {
        self.entries.lock().drain(..).collect()
    }

    pub fn remove_task(&self, task_id: &str) -> Option<QueuedTask> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|q| q.task.task_id == task_id)?;
        entries.remove(index)
    }
}
