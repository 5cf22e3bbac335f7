// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread scheduler and dispatcher fiber.
//!
//! Each OS thread that runs fibers owns one `Scheduler` in thread-local
//! storage, created on first use together with the thread's main fiber and
//! its dispatcher. The part other threads may touch (ready queue, remote
//! inbox, unpark handle) lives in an `Arc<Peer>`.
//!
//! Every suspension goes through the dispatcher: the suspending fiber leaves
//! a [`Handoff`] describing where it should go and switches away; the
//! dispatcher carries the handoff out once the fiber is fully suspended,
//! then picks the next fiber (local queue, inbox, injector, steal) and
//! resumes it directly.
//!
//! After any switch the code may be running on another OS thread, so
//! thread-local state is only reached through the `#[inline(never)]`
//! accessors below and never held across a switch.

use std::cell::{Cell, OnceCell, RefCell};
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::config::Config;
use crate::context::{self, ExecutionPoint};
use crate::error::{fatal, FiberError};
use crate::fiber::{Fiber, FiberId, Link, TerminatedQueue};
use crate::queue::{InjectorQueue, WorkStealingQueue};
use crate::runtime::Pool;
use crate::stack::Stack;

thread_local! {
    /// The fiber executing on this thread right now.
    static ACTIVE: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static SCHEDULER: OnceCell<Scheduler> = const { OnceCell::new() };
}

/// Cross-thread face of a scheduler.
pub(crate) struct Peer {
    id: usize,
    ready: WorkStealingQueue,
    /// Fibers woken by other threads; drained into `ready` by the owner.
    inbox: InjectorQueue,
    thread: Thread,
    sleeping: AtomicBool,
}

impl Peer {
    fn new(id: usize) -> Self {
        Self {
            id,
            ready: WorkStealingQueue::new(),
            inbox: InjectorQueue::new(),
            thread: thread::current(),
            sleeping: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Hand a fiber to this scheduler from another thread.
    pub fn push_remote(&self, fiber: Arc<Fiber>) {
        self.inbox.push(fiber);
        self.unpark();
    }

    pub fn unpark(&self) {
        self.thread.unpark();
    }

    pub fn take_inbox(&self) -> Vec<Arc<Fiber>> {
        self.inbox.pop_all()
    }

    /// A peer for the calling thread that belongs to no pool.
    #[cfg(test)]
    pub fn detached(id: usize) -> Arc<Self> {
        Arc::new(Self::new(id))
    }

    #[cfg(test)]
    pub fn inbox_snapshot(&self) -> Vec<Arc<Fiber>> {
        self.inbox.snapshot()
    }
}

/// What the dispatcher does with a fiber that just switched to it.
enum Handoff {
    /// Back to the tail of the local ready queue.
    Yield(Arc<Fiber>),
    /// Into `on`'s wait list, or straight back to ready if `on` finished.
    Wait { fiber: Arc<Fiber>, on: Arc<Fiber> },
    /// Worker main fiber sleeping until its runtime shuts down.
    Park(Arc<Fiber>),
    /// Body returned; move to the terminated queue and release waiters.
    Terminate(Arc<Fiber>),
    /// `parent` back to ready, `child` runs next.
    Dispatch { parent: Arc<Fiber>, child: Arc<Fiber> },
}

/// Ids of the fibers bootstrapped for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub scheduler: usize,
    pub main: FiberId,
    pub dispatcher: FiberId,
}

/// Thread-local scheduler.
pub(crate) struct Scheduler {
    peer: Arc<Peer>,
    pool: Arc<Pool>,
    main: Arc<Fiber>,
    dispatcher: Arc<Fiber>,
    /// Mirrors ACTIVE, but owns a count.
    running: RefCell<Arc<Fiber>>,
    terminated: TerminatedQueue,
    handoff: Cell<Option<Handoff>>,
    rng: Cell<u64>,
}

impl Scheduler {
    fn new(pool: Arc<Pool>) -> Result<Self, FiberError> {
        let peer = Arc::new(Peer::new(pool.next_peer_id()));
        let main = main_context(&peer);
        let dispatcher = dispatching_context(&peer, &pool)?;
        pool.register(peer.clone());
        log::debug!(
            "scheduler {} bootstrapped on {:?} (main {}, dispatcher {})",
            peer.id,
            thread::current().name().unwrap_or("<unnamed>"),
            main.id(),
            dispatcher.id()
        );
        Ok(Self {
            rng: Cell::new((peer.id as u64).wrapping_add(0x9E37_79B9_7F4A_7C15)),
            peer,
            pool,
            running: RefCell::new(main.clone()),
            main,
            dispatcher,
            terminated: TerminatedQueue::default(),
            handoff: Cell::new(None),
        })
    }

    fn context(&self) -> ThreadContext {
        ThreadContext {
            scheduler: self.peer.id,
            main: self.main.id(),
            dispatcher: self.dispatcher.id(),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Enqueue a fiber on this thread's own ready queue.
    pub fn re_schedule(&self, fiber: Arc<Fiber>) {
        self.peer.ready.push(fiber);
    }

    /// Launch a freshly built fiber on this thread.
    pub fn attach_new_fiber(&self, fiber: Arc<Fiber>) -> FiberId {
        let id = fiber.id();
        fiber.attach_scheduler(&self.peer);
        self.pool.fiber_started();
        self.re_schedule(fiber);
        self.pool.notify_idle(&self.peer);
        log::trace!("scheduler {} launched {}", self.peer.id, id);
        id
    }

    /// Like `attach_new_fiber`, but leaves the fiber out of the ready queue
    /// so the caller can resume it directly.
    fn adopt_new_fiber(&self, fiber: &Arc<Fiber>) {
        fiber.attach_scheduler(&self.peer);
        self.pool.fiber_started();
        log::trace!("scheduler {} dispatching {}", self.peer.id, fiber.id());
    }

    fn stash(&self, handoff: Handoff) {
        if self.handoff.replace(Some(handoff)).is_some() {
            fatal!("scheduler {} already holds a pending handoff", self.peer.id);
        }
    }

    /// Carry out whatever the last suspending fiber asked for. It is fully
    /// switched out by now, so it is safe to publish it to other threads.
    /// Returns the fiber that must run next, if the handoff names one.
    fn complete_handoff(&self) -> Option<Arc<Fiber>> {
        let handoff = self.handoff.take()?;
        match handoff {
            Handoff::Yield(fiber) => self.re_schedule(fiber),
            Handoff::Wait { fiber, on } => {
                if let Err(fiber) = on.add_waiter(fiber) {
                    self.re_schedule(fiber);
                }
            }
            Handoff::Park(fiber) => self.pool.park(fiber, self),
            Handoff::Terminate(fiber) => {
                log::trace!("{} terminated on scheduler {}", fiber.id(), self.peer.id);
                self.pool.fiber_finished();
                fiber.mark_terminated(&self.terminated);
            }
            Handoff::Dispatch { parent, child } => {
                self.re_schedule(parent);
                self.pool.notify_idle(&self.peer);
                return Some(child);
            }
        }
        None
    }

    /// Drop the terminated queue's references and hand stacks back.
    fn reclaim(&self) {
        let finished = self.terminated.drain();
        if finished.is_empty() {
            return;
        }
        log::trace!("scheduler {} reclaiming {} fibers", self.peer.id, finished.len());
        for fiber in finished {
            fiber.release_stack();
        }
    }

    fn find_ready(&self) -> Option<Arc<Fiber>> {
        for fiber in self.peer.take_inbox() {
            self.re_schedule(fiber);
        }
        if let Some(fiber) = self.peer.ready.pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.pool.injector().pop() {
            fiber.attach_scheduler(&self.peer);
            return Some(fiber);
        }
        self.steal()
    }

    /// Try every other peer once, starting from a random victim.
    fn steal(&self) -> Option<Arc<Fiber>> {
        let peers = self.pool.peers();
        if peers.len() < 2 {
            return None;
        }
        let mut state = self.rng.get();
        let start = (xorshift64(&mut state) as usize) % peers.len();
        self.rng.set(state);

        for k in 0..peers.len() {
            let victim = &peers[(start + k) % peers.len()];
            if Arc::ptr_eq(victim, &self.peer) {
                continue;
            }
            if let Some(fiber) = victim.ready.steal() {
                fiber.detach_scheduler();
                fiber.attach_scheduler(&self.peer);
                log::trace!(
                    "scheduler {} stole {} from scheduler {}",
                    self.peer.id,
                    fiber.id(),
                    victim.id
                );
                return Some(fiber);
            }
        }
        None
    }

    /// One dispatcher decision: settle the handoff, then block until some
    /// fiber is ready.
    fn next_ready(&self) -> Arc<Fiber> {
        let config = self.pool.config();
        let mut spins = 0;
        loop {
            let launched = self.complete_handoff();
            self.reclaim();
            if let Some(fiber) = launched.or_else(|| self.find_ready()) {
                return fiber;
            }
            if spins < config.idle_spins {
                spins += 1;
                hint::spin_loop();
                continue;
            }
            self.idle(config);
            spins = 0;
        }
    }

    /// Nothing to run anywhere. Park until a waker unparks this thread or
    /// the timeout lets us look for steal opportunities again.
    fn idle(&self, config: &Config) {
        self.peer.sleeping.store(true, Ordering::Release);
        if self.peer.inbox.is_empty() && self.pool.injector().is_empty() {
            thread::park_timeout(config.idle_timeout);
        }
        self.peer.sleeping.store(false, Ordering::Release);
    }

    /// Point the thread at `next` and return the switch endpoints.
    fn prepare_resume(&self, next: Arc<Fiber>) -> (*mut ExecutionPoint, *const ExecutionPoint) {
        match next.scheduler() {
            Some(owner) if Arc::ptr_eq(&owner, &self.peer) => {}
            _ => fatal!("{} resumed on scheduler {} it is not attached to", next.id(), self.peer.id),
        }
        if next.link_state() != Link::Unlinked {
            fatal!("{} resumed while linked into {:?}", next.id(), next.link_state());
        }
        set_active(&next);
        let to = next.point() as *const ExecutionPoint;
        // The previous fiber stays alive through the scheduler (main,
        // dispatcher) or the pending handoff.
        let previous = self.running.replace(next);
        (previous.point(), to)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(child) = self.complete_handoff() {
            self.re_schedule(child);
        }
        self.reclaim();
        self.pool.unregister(&self.peer);

        let mut stranded = self.peer.ready.drain_all();
        stranded.extend(self.peer.take_inbox());
        if !stranded.is_empty() {
            // Their stacks hold live frames; running destructors for what
            // they captured is not possible from here.
            log::warn!(
                "scheduler {} exiting with {} unfinished fibers; leaking them",
                self.peer.id,
                stranded.len()
            );
            for fiber in stranded {
                std::mem::forget(fiber);
            }
        }
        log::debug!("scheduler {} shut down", self.peer.id);
    }
}

fn main_context(peer: &Arc<Peer>) -> Arc<Fiber> {
    let main = Fiber::main();
    main.attach_scheduler(peer);
    main
}

fn dispatching_context(peer: &Arc<Peer>, pool: &Pool) -> Result<Arc<Fiber>, FiberError> {
    let stack = Stack::allocate(pool.stacks().clone(), pool.config().stack_size)?;
    let dispatcher = Fiber::dispatcher(stack, dispatcher_entry)?;
    dispatcher.attach_scheduler(peer);
    Ok(dispatcher)
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn install(cell: &OnceCell<Scheduler>, pool: Arc<Pool>) -> Result<&Scheduler, FiberError> {
    let scheduler = Scheduler::new(pool)?;
    set_active(&scheduler.main);
    if cell.set(scheduler).is_err() {
        fatal!("scheduler bootstrapped twice on one thread");
    }
    match cell.get() {
        Some(s) => Ok(s),
        None => fatal!("scheduler vanished right after bootstrap"),
    }
}

/// Run `f` against this thread's scheduler, bootstrapping a standalone one
/// on first use.
///
/// Bootstrap failure aborts here, since callers have no error channel.
/// Fallible entry points call [`bootstrap`] first and return its error.
#[inline(never)]
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let scheduler = match cell.get() {
            Some(s) => s,
            None => match install(cell, Pool::standalone()) {
                Ok(s) => s,
                Err(e) => fatal!("failed to bootstrap fiber scheduler: {}", e),
            },
        };
        f(scheduler)
    })
}

/// Like `with_scheduler`, but never bootstraps.
#[inline(never)]
pub(crate) fn try_with_scheduler<R>(f: impl FnOnce(&Scheduler) -> R) -> Option<R> {
    SCHEDULER
        .try_with(|cell| cell.get().map(f))
        .ok()
        .flatten()
}

/// Bind the calling thread to `pool`. Idempotent for the same pool.
pub(crate) fn bootstrap_in(pool: &Arc<Pool>) -> Result<ThreadContext, FiberError> {
    SCHEDULER.with(|cell| match cell.get() {
        Some(s) if Arc::ptr_eq(&s.pool, pool) => Ok(s.context()),
        Some(_) => Err(FiberError::ForeignRuntime),
        None => install(cell, pool.clone()).map(Scheduler::context),
    })
}

/// Set up the calling thread's main fiber, scheduler and dispatcher.
///
/// Runs at most once per thread; later calls return the same ids.
pub fn bootstrap() -> Result<ThreadContext, FiberError> {
    SCHEDULER.with(|cell| match cell.get() {
        Some(s) => Ok(s.context()),
        None => install(cell, Pool::standalone()).map(Scheduler::context),
    })
}

#[inline(never)]
fn set_active(fiber: &Arc<Fiber>) {
    ACTIVE.with(|active| active.set(Arc::as_ptr(fiber)));
}

/// Identity of the fiber running on the calling thread.
#[inline(never)]
pub fn current_id() -> FiberId {
    let active = ACTIVE.with(Cell::get);
    if active.is_null() {
        return with_scheduler(|s| s.running.borrow().id());
    }
    // SAFETY: ACTIVE always points at the fiber held in `running`.
    unsafe { (*active).id() }
}

pub(crate) fn current_fiber() -> Arc<Fiber> {
    with_scheduler(|s| s.running.borrow().clone())
}

/// Symmetric transfer: run `next`, suspending whatever runs now. Returns
/// when something later resumes the suspended fiber.
pub(crate) fn resume(next: Arc<Fiber>) {
    let (from, to) = with_scheduler(|s| s.prepare_resume(next));
    // SAFETY: both points belong to fibers kept alive by the scheduler or a
    // pending handoff, and `to` is owned by this thread until it suspends.
    unsafe { context::switch(from, to) };
}

/// Leave the running fiber with the dispatcher under `handoff`.
fn suspend(handoff: impl FnOnce(Arc<Fiber>) -> Handoff) {
    let dispatcher = with_scheduler(|s| {
        let current = s.running.borrow().clone();
        if current.is_dispatcher() {
            fatal!("the dispatcher fiber cannot suspend itself");
        }
        s.stash(handoff(current));
        s.dispatcher.clone()
    });
    resume(dispatcher);
}

/// Move the calling fiber to the tail of its ready queue and run others.
pub fn yield_now() {
    suspend(Handoff::Yield);
}

/// Block the calling fiber until `on` terminates.
pub(crate) fn suspend_and_wait(on: &Arc<Fiber>) {
    if on.is_finished() {
        return;
    }
    if current_id() == on.id() {
        fatal!("{} cannot wait on itself", on.id());
    }
    let on = on.clone();
    suspend(move |fiber| Handoff::Wait { fiber, on });
}

/// Start `child` on this thread right now. The calling fiber goes to the
/// back of the ready queue and continues once the dispatcher picks it.
pub(crate) fn launch_now(child: Arc<Fiber>) {
    with_scheduler(|s| s.adopt_new_fiber(&child));
    suspend(move |parent| Handoff::Dispatch { parent, child });
}

/// Park a worker thread's main fiber until its runtime shuts down.
pub(crate) fn park_main() {
    suspend(Handoff::Park);
}

/// Relink a fiber that stopped waiting into its own scheduler's ready
/// queue: locally if that is the calling thread, through the inbox
/// otherwise.
pub(crate) fn wake(fiber: Arc<Fiber>) {
    let Some(owner) = fiber.scheduler() else {
        log::warn!("{} woke after its scheduler exited; leaking it", fiber.id());
        std::mem::forget(fiber);
        return;
    };
    let local = try_with_scheduler(|s| Arc::ptr_eq(&s.peer, &owner)).unwrap_or(false);
    if local {
        owner.ready.push(fiber);
    } else {
        owner.push_remote(fiber);
    }
}

/// Entry point of every worker fiber.
pub(crate) extern "C" fn fiber_entry() {
    run_body();
    suspend(Handoff::Terminate);
    fatal!("terminated fiber was resumed");
}

/// Separate frame so the body and everything it owns is dropped before
/// the final switch abandons this stack.
fn run_body() {
    let body = current_fiber().take_body();
    match body {
        Some(body) => body(),
        None => fatal!("{} started without a body", current_id()),
    }
}

extern "C" fn dispatcher_entry() {
    run_dispatcher(dispatch);
}

/// The dispatcher owns its thread's fibers until the thread exits; its
/// body giving control back is fatal.
fn run_dispatcher(body: fn()) -> ! {
    body();
    fatal!("dispatcher fiber returned");
}

fn dispatch() {
    loop {
        let next = with_scheduler(Scheduler::next_ready);
        resume(next);
    }
}
