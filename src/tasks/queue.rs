//! Pending-task queue.
//!
//! Maintenance tasks always dispatch before backups and restores; within each
//! class the order is first-in first-out. The queue also enforces that a job
//! has at most one active (queued or running) task, and tracks the running set
//! against the concurrency limit.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::error::TaskError;
use crate::jobs::JobKind;

/// Identifies a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub job_id: Option<Uuid>,
}

/// A task waiting for a slot.
#[derive(Debug, Clone)]
pub struct QueuedTask<T> {
    pub task_id: Uuid,
    pub job_id: Option<Uuid>,
    pub kind: JobKind,
    pub payload: T,
}

/// Queue sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
}

#[derive(Debug)]
pub struct TaskQueue<T> {
    maintenance: VecDeque<QueuedTask<T>>,
    regular: VecDeque<QueuedTask<T>>,
    /// job id -> task id of its active task
    active_jobs: HashMap<Uuid, Uuid>,
    /// task id -> job id
    running: HashMap<Uuid, Option<Uuid>>,
    max_running: usize,
    paused: bool,
}

impl<T> TaskQueue<T> {
    pub fn new(max_running: usize) -> Self {
        Self {
            maintenance: VecDeque::new(),
            regular: VecDeque::new(),
            active_jobs: HashMap::new(),
            running: HashMap::new(),
            max_running: max_running.max(1),
            paused: false,
        }
    }

    /// Admit a task. Rejects a second active task for the same job.
    pub fn enqueue(&mut self, task: QueuedTask<T>) -> Result<TaskHandle, TaskError> {
        if let Some(job_id) = task.job_id {
            if self.active_jobs.contains_key(&job_id) {
                return Err(TaskError::DuplicateActiveJob { job_id });
            }
            self.active_jobs.insert(job_id, task.task_id);
        }
        let handle = TaskHandle {
            task_id: task.task_id,
            job_id: task.job_id,
        };
        match task.kind {
            JobKind::Maintenance => self.maintenance.push_back(task),
            JobKind::Backup | JobKind::Restore => self.regular.push_back(task),
        }
        Ok(handle)
    }

    /// Pop the next task if a slot is free and the queue is not paused.
    /// The task counts as running from here until [`TaskQueue::finish`].
    pub fn dequeue_next(&mut self) -> Option<QueuedTask<T>> {
        if self.paused || self.running.len() >= self.max_running {
            return None;
        }
        let task = self
            .maintenance
            .pop_front()
            .or_else(|| self.regular.pop_front())?;
        self.running.insert(task.task_id, task.job_id);
        Some(task)
    }

    /// Remove a queued task. Returns `None` if it is not waiting.
    pub fn remove_queued(&mut self, task_id: Uuid) -> Option<QueuedTask<T>> {
        for queue in [&mut self.maintenance, &mut self.regular] {
            if let Some(pos) = queue.iter().position(|t| t.task_id == task_id) {
                let task = queue.remove(pos)?;
                if let Some(job_id) = task.job_id {
                    self.active_jobs.remove(&job_id);
                }
                return Some(task);
            }
        }
        None
    }

    /// Drain every waiting task.
    pub fn drain_queued(&mut self) -> Vec<QueuedTask<T>> {
        let drained: Vec<_> = self
            .maintenance
            .drain(..)
            .chain(self.regular.drain(..))
            .collect();
        for task in &drained {
            if let Some(job_id) = task.job_id {
                self.active_jobs.remove(&job_id);
            }
        }
        drained
    }

    /// Release a running task's slot and its job's active marker.
    pub fn finish(&mut self, task_id: Uuid) {
        if let Some(job_id) = self.running.remove(&task_id).flatten() {
            if self.active_jobs.get(&job_id) == Some(&task_id) {
                self.active_jobs.remove(&job_id);
            }
        }
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running.keys().copied().collect()
    }

    /// The active task of a job, if any.
    pub fn active_task_for(&self, job_id: Uuid) -> Option<Uuid> {
        self.active_jobs.get(&job_id).copied()
    }

    pub fn set_max_running(&mut self, max_running: usize) {
        self.max_running = max_running.max(1);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self.maintenance.len() + self.regular.len(),
            running: self.running.len(),
        }
    }
}
