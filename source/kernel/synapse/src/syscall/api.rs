// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: kmain::Kernel, sem::SemaphoreTable, task::Task, time::TickClock
//! INVARIANTS: Decode→Check→Execute; sem_init publishes a handle only after the
//!             slot is initialized and releases the slot if the copy-out fails

use alloc::sync::Arc;

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_EXIT, SYSCALL_FREEPMEM, SYSCALL_GETPID,
    SYSCALL_KILL, SYSCALL_SBRK, SYSCALL_SEM_DESTROY, SYSCALL_SEM_INIT, SYSCALL_SEM_POST,
    SYSCALL_SEM_WAIT, SYSCALL_SLEEP, SYSCALL_UPTIME,
};
use crate::config::PSHARED_PROCESS;
use crate::kmain::Kernel;
use crate::mm::PAGE_SIZE;
use crate::sem::SemHandle;
use crate::task::{Pid, Task};

/// State visible to a handler: the kernel and the calling task.
pub struct Context<'a> {
    pub kernel: &'a Kernel,
    pub task: &'a Arc<Task>,
}

impl<'a> Context<'a> {
    pub fn new(kernel: &'a Kernel, task: &'a Arc<Task>) -> Self {
        Self { kernel, task }
    }

    fn read_sem(&self, addr: usize) -> SysResult<SemHandle> {
        let mut raw = [0u8; 4];
        self.kernel.copy_in(self.task, &mut raw, addr)?;
        Ok(SemHandle::from_raw(u32::from_le_bytes(raw)))
    }
}

/// Registers every handler in `table`.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_KILL, sys_kill);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_SLEEP, sys_sleep);
    table.register(SYSCALL_UPTIME, sys_uptime);
    table.register(SYSCALL_FREEPMEM, sys_freepmem);
    table.register(SYSCALL_SEM_INIT, sys_sem_init);
    table.register(SYSCALL_SEM_DESTROY, sys_sem_destroy);
    table.register(SYSCALL_SEM_WAIT, sys_sem_wait);
    table.register(SYSCALL_SEM_POST, sys_sem_post);
}

fn sys_exit(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    Err(Error::Exit(args.int(0)))
}

fn sys_kill(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let pid = args.int(0);
    if pid <= 0 {
        return Err(Error::InvalidArgument);
    }
    ctx.kernel.tasks().kill(pid as Pid)?;
    Ok(0)
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.task.pid() as usize)
}

/// Lazy break adjustment; pages are faulted in on first touch.
fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let delta = args.int(0) as isize;
    let old = ctx.task.space().lock().sbrk(delta, ctx.kernel.frames())?;
    Ok(old)
}

fn sys_sleep(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let ticks = args.int(0);
    if ticks < 0 {
        return Err(Error::InvalidArgument);
    }
    ctx.kernel.clock().sleep(ticks as u64, &**ctx.task)?;
    Ok(0)
}

fn sys_uptime(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.kernel.clock().now() as usize)
}

fn sys_freepmem(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.kernel.frames().free_frames() * PAGE_SIZE)
}

fn sys_sem_init(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    // Decode
    let addr = args.get(0);
    let pshared = args.int(1);
    let value = args.int(2);
    // Check
    if pshared != PSHARED_PROCESS || value < 0 {
        return Err(Error::InvalidArgument);
    }
    // Execute
    let sems = ctx.kernel.semaphores();
    let sem = sems.allocate()?;
    if let Err(err) = sems.init(sem, value as u32) {
        sems.deallocate(sem);
        return Err(err.into());
    }
    if let Err(err) = ctx.kernel.copy_out(ctx.task, addr, &sem.to_raw().to_le_bytes()) {
        sems.deallocate(sem);
        return Err(err.into());
    }
    log_debug!(target: "sem", "pid={} sem_init slot={} value={}", ctx.task.pid(), sem.index(), value);
    Ok(0)
}

fn sys_sem_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let sem = ctx.read_sem(args.get(0))?;
    ctx.kernel.semaphores().destroy(sem)?;
    Ok(0)
}

fn sys_sem_wait(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let sem = ctx.read_sem(args.get(0))?;
    ctx.kernel.semaphores().wait(sem, &**ctx.task)?;
    Ok(0)
}

fn sys_sem_post(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let sem = ctx.read_sem(args.get(0))?;
    ctx.kernel.semaphores().post(sem)?;
    Ok(0)
}
