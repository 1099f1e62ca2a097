//! A cooperative task table with a FIFO run queue.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Scheduler, SuspendReason, Wakeup};
use crate::id::TaskId;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Suspended(SuspendReason),
    Finished,
}

#[derive(Debug)]
struct TaskEntry {
    state: TaskState,
    /// Delivered by the last `resume`, handed out by `next_runnable`.
    wakeup: Option<Wakeup>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskEntry>,
    run_queue: VecDeque<TaskId>,
    next_id: u64,
}

/// Single logical scheduler: a task table plus a run queue.
///
/// The owner drives it by popping [`next_runnable`](Self::next_runnable) and
/// running the continuation for that task.
#[derive(Debug, Default)]
pub struct CooperativeScheduler {
    inner: Mutex<Inner>,
}

impl CooperativeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new runnable task.
    pub fn spawn(&self) -> TaskId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let task = TaskId(inner.next_id);
        inner.tasks.insert(
            task,
            TaskEntry {
                state: TaskState::Runnable,
                wakeup: None,
            },
        );
        inner.run_queue.push_back(task);
        trace!(task = %task, "Spawned task");
        task
    }

    /// Pop the next runnable task and the wakeup that made it runnable, if any.
    pub fn next_runnable(&self) -> Option<(TaskId, Option<Wakeup>)> {
        let mut inner = self.inner.lock();
        while let Some(task) = inner.run_queue.pop_front() {
            if let Some(entry) = inner.tasks.get_mut(&task) {
                if entry.state == TaskState::Runnable {
                    return Some((task, entry.wakeup.take()));
                }
            }
        }
        None
    }

    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.inner.lock().tasks.get(&task).map(|e| e.state)
    }

    /// Mark a task finished; later wakeups for it are ignored.
    pub fn finish(&self, task: TaskId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.tasks.get_mut(&task) {
            entry.state = TaskState::Finished;
            entry.wakeup = None;
        }
        inner.run_queue.retain(|t| *t != task);
    }

    pub fn suspended_count(&self) -> usize {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|e| matches!(e.state, TaskState::Suspended(_)))
            .count()
    }
}

impl Scheduler for CooperativeScheduler {
    fn suspend(&self, task: TaskId, reason: SuspendReason) {
        let mut inner = self.inner.lock();
        let entry = inner.tasks.entry(task).or_insert(TaskEntry {
            state: TaskState::Runnable,
            wakeup: None,
        });
        if entry.state == TaskState::Finished {
            return;
        }
        entry.state = TaskState::Suspended(reason);
        entry.wakeup = None;
        inner.run_queue.retain(|t| *t != task);
        debug!(task = %task, reason = ?reason, "Task suspended");
    }

    fn resume(&self, task: TaskId, wakeup: Wakeup) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.tasks.get_mut(&task) else {
            trace!(task = %task, "Resume for unknown task ignored");
            return;
        };
        if !matches!(entry.state, TaskState::Suspended(_)) {
            trace!(task = %task, state = ?entry.state, "Resume for non-suspended task ignored");
            return;
        }
        entry.state = TaskState::Runnable;
        entry.wakeup = Some(wakeup);
        inner.run_queue.push_back(task);
        debug!(task = %task, wakeup = ?wakeup, "Task resumed");
    }
}
