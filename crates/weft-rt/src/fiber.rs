// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber control block.
//!
//! A `Fiber` is shared as `Arc<Fiber>`: the scheduler, a queue, a wait list
//! and any join handle each hold one count. It records its role, which
//! scheduler resumes it, its saved execution point, and the fibers blocked
//! on its termination.
//!
//! Queue membership is a single tagged state ([`Link`]) flipped with a CAS
//! by whichever queue takes or drops the fiber, so a fiber can be in at
//! most one of {ready, wait, terminated} at a time.

use std::cell::{RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::context::{Entry, ExecutionPoint};
use crate::error::{fatal, FiberError};
use crate::scheduler::{self, Peer};
use crate::stack::Stack;

bitflags! {
    /// Role and affinity of a fiber. Fixed at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiberFlags: u8 {
        /// Ordinary fiber running a user body.
        const WORKER = 0b0001;
        /// The flow a thread was already running when it bootstrapped.
        const MAIN = 0b0010;
        /// Per-thread fiber that picks and resumes ready fibers.
        const DISPATCHER = 0b0100;
        /// Must only run on the thread that created it; never stolen.
        const PINNED = 0b1000;
    }
}

/// Opaque fiber identity: the control block's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(usize);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber@{:#x}", self.0)
    }
}

/// Which queue, if any, currently holds a fiber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// In no queue: running, being handed off, or not started yet.
    Unlinked = 0,
    /// In a ready queue (local, inbox, or injector).
    Ready = 1,
    /// In another fiber's wait list, or parked on a runtime.
    Wait = 2,
    /// In its scheduler's terminated queue, awaiting reclamation.
    Terminated = 3,
}

impl Link {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Wait,
            3 => Self::Terminated,
            _ => Self::Unlinked,
        }
    }
}

/// Body of a worker fiber, already wrapped to store its own result.
pub(crate) type Body = Box<dyn FnOnce() + Send>;

struct WaitList {
    /// Set once the fiber terminates; later waiters must not block.
    finished: bool,
    fibers: VecDeque<Arc<Fiber>>,
}

/// Fiber control block.
pub struct Fiber {
    flags: FiberFlags,
    name: Option<String>,
    link: AtomicU8,
    scheduler: spin::Mutex<Weak<Peer>>,
    point: UnsafeCell<ExecutionPoint>,
    stack: spin::Mutex<Option<Stack>>,
    body: spin::Mutex<Option<Body>>,
    waiters: spin::Mutex<WaitList>,
}

// `point` is only accessed by the thread that owns the fiber at that
// moment; ownership passes between threads through the locked queues.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    fn build(flags: FiberFlags, name: Option<String>, point: ExecutionPoint, stack: Option<Stack>, body: Option<Body>) -> Self {
        Self {
            flags,
            name,
            link: AtomicU8::new(Link::Unlinked as u8),
            scheduler: spin::Mutex::new(Weak::new()),
            point: UnsafeCell::new(point),
            stack: spin::Mutex::new(stack),
            body: spin::Mutex::new(body),
            waiters: spin::Mutex::new(WaitList {
                finished: false,
                fibers: VecDeque::new(),
            }),
        }
    }

    /// Control block for the flow that is executing right now.
    pub(crate) fn main() -> Arc<Self> {
        Arc::new(Self::build(
            FiberFlags::MAIN | FiberFlags::PINNED,
            Some("main".to_string()),
            ExecutionPoint::current(),
            None,
            None,
        ))
    }

    /// The per-thread dispatcher. Owned solely by its scheduler.
    pub(crate) fn dispatcher(stack: Stack, entry: Entry) -> Result<Arc<Self>, FiberError> {
        let point = ExecutionPoint::new(&stack, entry).map_err(FiberError::ContextInit)?;
        Ok(Arc::new(Self::build(
            FiberFlags::DISPATCHER | FiberFlags::PINNED,
            Some("dispatcher".to_string()),
            point,
            Some(stack),
            None,
        )))
    }

    /// An ordinary fiber that will run `body` the first time it is resumed.
    pub(crate) fn worker(
        body: Body,
        stack: Stack,
        entry: Entry,
        pinned: bool,
        name: Option<String>,
    ) -> Result<Arc<Self>, FiberError> {
        let point = ExecutionPoint::new(&stack, entry).map_err(FiberError::ContextInit)?;
        let mut flags = FiberFlags::WORKER;
        if pinned {
            flags |= FiberFlags::PINNED;
        }
        Ok(Arc::new(Self::build(flags, name, point, Some(stack), Some(body))))
    }

    pub fn id(&self) -> FiberId {
        FiberId(self as *const Self as usize)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Thread affinity: pinned fibers are skipped by `steal`.
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(FiberFlags::PINNED)
    }

    pub fn is_main(&self) -> bool {
        self.flags.contains(FiberFlags::MAIN)
    }

    pub fn is_dispatcher(&self) -> bool {
        self.flags.contains(FiberFlags::DISPATCHER)
    }

    pub fn link_state(&self) -> Link {
        Link::from_u8(self.link.load(Ordering::Acquire))
    }

    /// Move from `Unlinked` into `to`. Fails with the current state if the
    /// fiber is already in some queue.
    pub(crate) fn try_link(&self, to: Link) -> Result<(), Link> {
        self.link
            .compare_exchange(Link::Unlinked as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Link::from_u8)
    }

    pub(crate) fn link(&self, to: Link) {
        if let Err(current) = self.try_link(to) {
            fatal!("{} linked into {:?} while already in {:?}", self.id(), to, current);
        }
    }

    pub(crate) fn try_unlink(&self, from: Link) -> Result<(), Link> {
        self.link
            .compare_exchange(from as u8, Link::Unlinked as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Link::from_u8)
    }

    pub(crate) fn unlink(&self, from: Link) {
        if let Err(current) = self.try_unlink(from) {
            fatal!("{} unlinked from {:?} but is in {:?}", self.id(), from, current);
        }
    }

    /// Bind to the scheduler that will resume this fiber. Rebinding to a
    /// different scheduler without `detach_scheduler` is fatal.
    pub(crate) fn attach_scheduler(&self, peer: &Arc<Peer>) {
        let mut slot = self.scheduler.lock();
        if let Some(existing) = slot.upgrade() {
            if Arc::ptr_eq(&existing, peer) {
                return;
            }
            fatal!("{} attached to scheduler {} and {}", self.id(), existing.id(), peer.id());
        }
        *slot = Arc::downgrade(peer);
    }

    /// Forget the current scheduler so a thief can attach. Only unpinned
    /// fibers may migrate.
    pub(crate) fn detach_scheduler(&self) {
        if self.is_pinned() {
            fatal!("{} is pinned and cannot leave its scheduler", self.id());
        }
        *self.scheduler.lock() = Weak::new();
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<Peer>> {
        self.scheduler.lock().upgrade()
    }

    pub(crate) fn point(&self) -> *mut ExecutionPoint {
        self.point.get()
    }

    pub(crate) fn take_body(&self) -> Option<Body> {
        self.body.lock().take()
    }

    /// Give the stack back to its provider. Only valid once the fiber has
    /// terminated and fully switched away.
    pub(crate) fn release_stack(&self) {
        drop(self.stack.lock().take());
    }

    pub fn is_finished(&self) -> bool {
        self.waiters.lock().finished
    }

    /// Block `waiter` on this fiber's termination. Hands the waiter back if
    /// this fiber has already finished, in which case it must not block.
    pub(crate) fn add_waiter(&self, waiter: Arc<Fiber>) -> Result<(), Arc<Fiber>> {
        let mut list = self.waiters.lock();
        if list.finished {
            return Err(waiter);
        }
        waiter.link(Link::Wait);
        list.fibers.push_back(waiter);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().fibers.len()
    }

    /// Move this fiber into `terminated` and wake everything waiting on it.
    /// Runs on the dispatcher after the fiber has switched away for the
    /// last time.
    pub(crate) fn mark_terminated(self: &Arc<Self>, terminated: &TerminatedQueue) {
        terminated.push(self.clone());
        self.release();
    }

    /// Wake all waiters: each leaves the wait list and goes to its own
    /// scheduler's ready queue. Returns how many were woken.
    pub(crate) fn release(&self) -> usize {
        if self.link_state() != Link::Terminated {
            fatal!("{} released before being terminated", self.id());
        }
        let woken: Vec<Arc<Fiber>> = {
            let mut list = self.waiters.lock();
            list.finished = true;
            list.fibers.drain(..).collect()
        };
        let count = woken.len();
        for waiter in woken {
            waiter.unlink(Link::Wait);
            scheduler::wake(waiter);
        }
        count
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("link", &self.link_state())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let link = self.link_state();
        if link != Link::Unlinked {
            fatal!("{} destroyed while linked into {:?}", self.id(), link);
        }
        if !self.waiters.get_mut().fibers.is_empty() {
            fatal!("{} destroyed with fibers still waiting on it", self.id());
        }
    }
}

/// Per-thread list of finished fibers awaiting reclamation. Only the owning
/// dispatcher touches it.
#[derive(Default)]
pub(crate) struct TerminatedQueue {
    fibers: RefCell<VecDeque<Arc<Fiber>>>,
}

impl TerminatedQueue {
    pub fn push(&self, fiber: Arc<Fiber>) {
        fiber.link(Link::Terminated);
        self.fibers.borrow_mut().push_back(fiber);
    }

    /// Unlink and hand out everything queued so far.
    pub fn drain(&self) -> Vec<Arc<Fiber>> {
        let drained: Vec<_> = self.fibers.borrow_mut().drain(..).collect();
        for fiber in &drained {
            fiber.unlink(Link::Terminated);
        }
        drained
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fibers.borrow().len()
    }
}
