//! Adapter that lets tokio tasks wait on core continuations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::{Scheduler, SuspendReason, Wakeup};
use crate::id::TaskId;

#[derive(Debug, Default)]
struct Slot {
    notify: Notify,
    wakeups: Mutex<VecDeque<Wakeup>>,
    suspended: Mutex<Option<SuspendReason>>,
}

/// Maps each registered task to a [`Notify`].
///
/// `Notify` keeps a permit when nobody is waiting yet, so a `resume` that
/// lands before the caller reaches [`wait`](Self::wait) is not lost.
#[derive(Debug, Default)]
pub struct TokioScheduler {
    tasks: DashMap<TaskId, Arc<Slot>>,
    next_id: AtomicU64,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> TaskId {
        let task = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.tasks.insert(task, Arc::new(Slot::default()));
        task
    }

    pub fn unregister(&self, task: TaskId) {
        self.tasks.remove(&task);
    }

    /// Why the task is currently suspended, if it is.
    pub fn suspended_reason(&self, task: TaskId) -> Option<SuspendReason> {
        self.tasks.get(&task).and_then(|slot| *slot.suspended.lock())
    }

    /// Wait until the task is resumed. Returns `None` for unknown tasks.
    pub async fn wait(&self, task: TaskId) -> Option<Wakeup> {
        let slot = self.tasks.get(&task).map(|s| Arc::clone(s.value()))?;
        loop {
            if let Some(wakeup) = slot.wakeups.lock().pop_front() {
                return Some(wakeup);
            }
            slot.notify.notified().await;
        }
    }
}

impl Scheduler for TokioScheduler {
    fn suspend(&self, task: TaskId, reason: SuspendReason) {
        if let Some(slot) = self.tasks.get(&task) {
            *slot.suspended.lock() = Some(reason);
        }
        trace!(task = %task, reason = ?reason, "Async task suspended");
    }

    fn resume(&self, task: TaskId, wakeup: Wakeup) {
        let Some(slot) = self.tasks.get(&task).map(|s| Arc::clone(s.value())) else {
            return;
        };
        *slot.suspended.lock() = None;
        slot.wakeups.lock().push_back(wakeup);
        slot.notify.notify_one();
        trace!(task = %task, wakeup = ?wakeup, "Async task resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resume_before_wait_is_kept() {
        let sched = TokioScheduler::new();
        let task = sched.register();
        sched.suspend(task, SuspendReason::RecordLock);
        assert_eq!(sched.suspended_reason(task), Some(SuspendReason::RecordLock));

        sched.resume(task, Wakeup::LockReleased);
        assert_eq!(sched.wait(task).await, Some(Wakeup::LockReleased));
        assert_eq!(sched.suspended_reason(task), None);
    }

    #[tokio::test]
    async fn test_wait_wakes_across_tasks() {
        let sched = Arc::new(TokioScheduler::new());
        let task = sched.register();

        let waiter = {
            let sched = Arc::clone(&sched);
            tokio::spawn(async move { sched.wait(task).await })
        };
        tokio::task::yield_now().await;
        sched.resume(task, Wakeup::LockReleased);

        assert_eq!(waiter.await.unwrap(), Some(Wakeup::LockReleased));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let sched = TokioScheduler::new();
        assert_eq!(sched.wait(TaskId(42)).await, None);
    }
}
