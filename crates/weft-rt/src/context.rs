// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Saved execution points and the stack-switch primitive.
//!
//! This is the only module that touches raw register state. It wraps the
//! libc `ucontext` family: `getcontext`/`makecontext` prepare a fresh point
//! on a fiber stack, `swapcontext` saves the current flow and resumes
//! another. Nothing else runs on the thread between the save and the
//! restore.

use std::fmt;
use std::io;
use std::mem;
use std::ptr;

use crate::error::fatal;
use crate::stack::Stack;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("weft-rt needs the glibc ucontext API (linux-gnu targets)");

/// Entry function of a fresh execution point. Must never return.
pub(crate) type Entry = extern "C" fn();

/// Suspended register snapshot plus stack pointer.
///
/// Boxed because glibc's `ucontext_t` holds a pointer into itself (the FP
/// register area) once saved, so it must not move.
pub(crate) struct ExecutionPoint {
    ctx: Box<libc::ucontext_t>,
}

// Only ever touched by the thread that currently owns the fiber; ownership
// moves between threads through the locked ready queues.
unsafe impl Send for ExecutionPoint {}

impl ExecutionPoint {
    /// Placeholder for a flow that is already running (a thread's main
    /// flow). Filled in the first time that flow switches away.
    pub fn current() -> Self {
        Self {
            // SAFETY: ucontext_t is plain old data; all-zero is a valid
            // "not yet saved" value.
            ctx: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Prepare a point that starts executing `entry` on `stack`.
    pub fn new(stack: &Stack, entry: Entry) -> io::Result<Self> {
        let mut point = Self::current();
        let ctx: *mut libc::ucontext_t = &mut *point.ctx;
        // SAFETY: ctx points at the boxed ucontext_t owned by `point`. The
        // stack outlives the point (both belong to one fiber) and `entry`
        // takes no arguments.
        unsafe {
            if libc::getcontext(ctx) != 0 {
                return Err(io::Error::last_os_error());
            }
            (*ctx).uc_stack.ss_sp = stack.base().cast();
            (*ctx).uc_stack.ss_size = stack.size();
            (*ctx).uc_stack.ss_flags = 0;
            (*ctx).uc_link = ptr::null_mut();
            libc::makecontext(ctx, entry, 0);
        }
        Ok(point)
    }
}

impl fmt::Debug for ExecutionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPoint")
            .field("sp", &self.ctx.uc_stack.ss_sp)
            .finish()
    }
}

/// Save the running flow into `from` and resume `to`.
///
/// Returns when some later `switch` names `from` as its target, possibly on
/// a different OS thread. Callers must not keep thread-local addresses live
/// across this call.
///
/// # Safety
/// Both pointers must be valid for the whole suspension. `to` must hold a
/// point produced by [`ExecutionPoint::new`] or saved by a previous switch,
/// and no other thread may be running or resuming it.
#[inline(never)]
pub(crate) unsafe fn switch(from: *mut ExecutionPoint, to: *const ExecutionPoint) {
    let from_ctx: *mut libc::ucontext_t = &mut *(*from).ctx;
    let to_ctx: *const libc::ucontext_t = &*(*to).ctx;
    if libc::swapcontext(from_ctx, to_ctx) != 0 {
        fatal!("swapcontext failed: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{FixedSizeStack, Stack};
    use std::cell::Cell;
    use std::sync::Arc;

    thread_local! {
        static MAIN: Cell<*mut ExecutionPoint> = const { Cell::new(ptr::null_mut()) };
        static SIDE: Cell<*mut ExecutionPoint> = const { Cell::new(ptr::null_mut()) };
        static STEPS: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn ping() {
        loop {
            STEPS.with(|s| s.set(s.get() + 1));
            let (side, main) = (SIDE.with(Cell::get), MAIN.with(Cell::get));
            unsafe { switch(side, main) };
        }
    }

    #[test]
    fn switch_round_trips_between_flows() {
        let stack = Stack::allocate(Arc::new(FixedSizeStack), 32 * 1024).unwrap();
        let mut side = ExecutionPoint::new(&stack, ping).unwrap();
        let mut main = ExecutionPoint::current();
        MAIN.with(|c| c.set(&mut main));
        SIDE.with(|c| c.set(&mut side));

        for expected in 1..=3 {
            unsafe { switch(&mut main, &side) };
            assert_eq!(STEPS.with(Cell::get), expected);
        }
        // `side` is parked inside ping(); dropping it just frees the memory.
    }
}
