//! The cooperative task executor that stands in for the original design's
//! OS threads (§5, §10.4). Generalizes the scancode-queue waker pattern
//! this crate's ancestor used for its keyboard driver: a ready-queue of
//! task ids backed by `crossbeam_queue::ArrayQueue`. Unlike the ancestor's
//! `futures_util::task::AtomicWaker`, which exists to let a foreign
//! interrupt handler race a `poll_next` call to register and fire a
//! waker, each `Waker` here is built and owned by this executor from the
//! moment a task is spawned, so a plain `Wake` impl that re-enqueues the
//! task id is enough — there is no outside producer to synchronize
//! against.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::task::{Context, Poll, Waker};

use crossbeam_queue::ArrayQueue;

use crate::task::{Task, TaskId};

const MAX_READY_QUEUE: usize = 256;

struct TaskWaker {
    task_id: TaskId,
    ready_queue: Arc<ArrayQueue<TaskId>>,
}

impl TaskWaker {
    fn new(task_id: TaskId, ready_queue: Arc<ArrayQueue<TaskId>>) -> Waker {
        Waker::from(Arc::new(TaskWaker { task_id, ready_queue }))
    }

    fn wake_task(&self) {
        if self.ready_queue.push(self.task_id).is_err() {
            log::warn!("executor: ready queue full, dropping wake for a task");
        }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

/// A single-threaded, cooperative executor. `Store` spawns one per
/// background role (journal writer, flusher, pager pool worker) or shares
/// one executor across several polling loops — callers choose.
pub struct Executor {
    tasks: BTreeMap<TaskId, Task>,
    ready_queue: Arc<ArrayQueue<TaskId>>,
    wakers: BTreeMap<TaskId, Waker>,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            tasks: BTreeMap::new(),
            ready_queue: Arc::new(ArrayQueue::new(MAX_READY_QUEUE)),
            wakers: BTreeMap::new(),
        }
    }

    pub fn spawn(&mut self, task: Task) -> TaskId {
        let id = task.id;
        if self.tasks.insert(id, task).is_some() {
            panic!("task with duplicate id spawned");
        }
        if self.ready_queue.push(id).is_err() {
            log::warn!("executor: ready queue full on spawn, task {id:?} will not run until woken");
        }
        id
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Polls every currently-ready task once. Returns the number of tasks
    /// that completed this pass.
    pub fn run_ready_tasks(&mut self) -> usize {
        let mut completed = 0;
        while let Some(id) = self.ready_queue.pop() {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue; // task finished and was removed already
            };
            let waker = self
                .wakers
                .entry(id)
                .or_insert_with(|| TaskWaker::new(id, Arc::clone(&self.ready_queue)))
                .clone();
            let mut context = Context::from_waker(&waker);
            match task.poll(&mut context) {
                Poll::Ready(()) => {
                    self.tasks.remove(&id);
                    self.wakers.remove(&id);
                    completed += 1;
                }
                Poll::Pending => {}
            }
        }
        completed
    }

    /// Runs until every spawned task has completed, spinning on
    /// `core::hint::spin_loop` between passes when nothing is ready. Meant
    /// for short-lived worker executors (pager pool, journal writer), not
    /// for a host's main loop, which should drive `run_ready_tasks` itself
    /// alongside other event sources.
    pub fn run_to_completion(&mut self) {
        while !self.is_idle() {
            if self.run_ready_tasks() == 0 && !self.ready_queue.is_empty() {
                continue;
            }
            if self.ready_queue.is_empty() && !self.is_idle() {
                core::hint::spin_loop();
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc as StdArc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn runs_simple_task_to_completion() {
        let counter = StdArc::new(AtomicU32::new(0));
        let c = StdArc::clone(&counter);
        let mut executor = Executor::new();
        executor.spawn(Task::new(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        executor.run_to_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yielding_task_eventually_completes() {
        let counter = StdArc::new(AtomicU32::new(0));
        let c = StdArc::clone(&counter);
        let mut executor = Executor::new();
        executor.spawn(Task::new(async move {
            crate::task::yield_now().await;
            crate::task::yield_now().await;
            c.fetch_add(1, Ordering::SeqCst);
        }));
        executor.run_to_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
