// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task records and the task table
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests
//! PUBLIC API: Task, TaskTable, TaskState, TaskError, Pid
//! DEPENDS_ON: mm::AddressSpace, sync::{Sleeper, park_current}
//! INVARIANTS: Pids are never reused; the killed flag only ever goes from false to true;
//!             the address-space lock is taken after any family lock

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::arena::Arena;
use crate::config::MAX_TASKS;
use crate::mm::AddressSpace;
use crate::sync::{self, Sleeper};

/// Process identifier.
pub type Pid = u32;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Zombie(i32),
}

#[must_use = "task errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// `MAX_TASKS` tasks are alive.
    TableFull,
    /// No live task has the requested pid.
    NoSuchTask,
}

/// A user process as seen by the memory and trap paths.
pub struct Task {
    pid: Pid,
    parent: Option<Pid>,
    killed: AtomicBool,
    state: Mutex<TaskState>,
    space: Mutex<AddressSpace>,
}

impl Task {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn space(&self) -> &Mutex<AddressSpace> {
        &self.space
    }

    /// Marks the task for termination at its next return to user mode.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn set_zombie(&self, code: i32) {
        *self.state.lock() = TaskState::Zombie(code);
    }
}

impl Sleeper for Task {
    fn killed(&self) -> bool {
        self.is_killed()
    }

    fn park(&self) {
        sync::park_current();
    }
}

/// Fixed-capacity table of live tasks.
pub struct TaskTable {
    tasks: Mutex<Arena<Arc<Task>, MAX_TASKS>>,
    next_pid: AtomicU32,
}

impl TaskTable {
    pub fn new() -> Self {
        Self { tasks: Mutex::new(Arena::new()), next_pid: AtomicU32::new(1) }
    }

    /// Creates a task with an empty address space.
    pub fn spawn(&self, parent: Option<Pid>) -> Result<Arc<Task>, TaskError> {
        let mut tasks = self.tasks.lock();
        if tasks.is_full() {
            return Err(TaskError::TableFull);
        }
        let task = Arc::new(Task {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            parent,
            killed: AtomicBool::new(false),
            state: Mutex::new(TaskState::Running),
            space: Mutex::new(AddressSpace::new()),
        });
        tasks.insert(Arc::clone(&task)).map_err(|_| TaskError::TableFull)?;
        log_debug!(target: "task", "spawn pid={} parent={:?}", task.pid, parent);
        Ok(task)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().iter().find(|(_, task)| task.pid == pid).map(|(_, task)| Arc::clone(task))
    }

    /// Sets the killed flag of `pid`.
    pub fn kill(&self, pid: Pid) -> Result<(), TaskError> {
        let task = self.get(pid).ok_or(TaskError::NoSuchTask)?;
        task.kill();
        Ok(())
    }

    /// Drops `pid` from the table.
    pub fn remove(&self, pid: Pid) -> Option<Arc<Task>> {
        let mut tasks = self.tasks.lock();
        let handle = tasks.iter().find(|(_, task)| task.pid == pid).map(|(handle, _)| handle)?;
        tasks.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(Task: Send, Sync);
