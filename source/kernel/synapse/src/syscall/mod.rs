// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs
//! DEPENDS_ON: sem, mm, task, time, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; failures reach userspace as -1

pub mod api;

use core::fmt;

use crate::mm::{AddressSpaceError, CopyError};
use crate::sem::SemError;
use crate::sync::Killed;
use crate::task::TaskError;

/// Maximum number of syscalls supported.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }

    /// Register `index` read as a C `int`.
    pub fn int(&self, index: usize) -> i32 {
        self.regs[index] as i32
    }
}

/// Public syscall numbers.
pub const SYSCALL_EXIT: usize = 2;
pub const SYSCALL_KILL: usize = 6;
pub const SYSCALL_GETPID: usize = 11;
pub const SYSCALL_SBRK: usize = 12;
pub const SYSCALL_SLEEP: usize = 13;
pub const SYSCALL_UPTIME: usize = 14;
/// Bytes of free physical memory.
pub const SYSCALL_FREEPMEM: usize = 23;
pub const SYSCALL_SEM_INIT: usize = 24;
pub const SYSCALL_SEM_DESTROY: usize = 25;
pub const SYSCALL_SEM_WAIT: usize = 26;
pub const SYSCALL_SEM_POST: usize = 27;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Argument rejected before any state changed.
    InvalidArgument,
    /// User pointer could not be read or written.
    BadAddress,
    /// Semaphore operation failed.
    Semaphore(SemError),
    /// Address-space update failed.
    AddressSpace(AddressSpaceError),
    /// Task lookup failed.
    Task(TaskError),
    /// Caller was killed while blocked.
    Killed,
    /// Caller asked to terminate with the given status.
    Exit(i32),
}

impl From<SemError> for Error {
    fn from(value: SemError) -> Self {
        match value {
            SemError::Killed => Self::Killed,
            other => Self::Semaphore(other),
        }
    }
}

impl From<AddressSpaceError> for Error {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<TaskError> for Error {
    fn from(value: TaskError) -> Self {
        Self::Task(value)
    }
}

impl From<CopyError> for Error {
    fn from(_: CopyError) -> Self {
        Self::BadAddress
    }
}

impl From<Killed> for Error {
    fn from(_: Killed) -> Self {
        Self::Killed
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Value placed in a0 for a failed call.
pub const fn encode_error(_: Error) -> usize {
    usize::MAX
}
