// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread pool of schedulers.
//!
//! A [`Runtime`] starts `workers` OS threads, each bootstrapping its own
//! scheduler and then parking its main fiber so the dispatcher serves the
//! shared pool. Fibers spawned from outside the pool go through an injector
//! queue; idle schedulers steal from each other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle as ThreadHandle};

use crate::config::Config;
use crate::error::{fatal, FiberError};
use crate::fiber::{Fiber, Link};
use crate::handle::{Builder, JoinHandle};
use crate::queue::InjectorQueue;
use crate::scheduler::{self, Peer, Scheduler};
use crate::stack::{allocator_for, StackAllocator};

/// State shared by every scheduler bound to one runtime. Threads that
/// bootstrap on their own get a private single-scheduler pool.
pub(crate) struct Pool {
    config: Config,
    stacks: Arc<dyn StackAllocator>,
    peers: spin::RwLock<Vec<Arc<Peer>>>,
    next_peer: AtomicUsize,
    injector: InjectorQueue,
    /// Spawned fibers that have not terminated yet.
    active: AtomicUsize,
    all_done: (Mutex<()>, Condvar),
    /// Worker main fibers waiting for shutdown.
    parked: spin::Mutex<Vec<Arc<Fiber>>>,
    shutdown: AtomicBool,
}

impl Pool {
    pub fn new(config: Config, stacks: Arc<dyn StackAllocator>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stacks,
            peers: spin::RwLock::new(Vec::new()),
            next_peer: AtomicUsize::new(0),
            injector: InjectorQueue::new(),
            active: AtomicUsize::new(0),
            all_done: (Mutex::new(()), Condvar::new()),
            parked: spin::Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Pool for a thread that bootstraps outside any runtime.
    pub fn standalone() -> Arc<Self> {
        let config = Config::from_env().with_workers(1);
        let stacks = allocator_for(config.protected_stacks);
        Self::new(config, stacks)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stacks(&self) -> &Arc<dyn StackAllocator> {
        &self.stacks
    }

    pub fn injector(&self) -> &InjectorQueue {
        &self.injector
    }

    pub fn next_peer_id(&self) -> usize {
        self.next_peer.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, peer: Arc<Peer>) {
        self.peers.write().push(peer);
    }

    pub fn unregister(&self, peer: &Arc<Peer>) {
        self.peers.write().retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn peers(&self) -> spin::RwLockReadGuard<'_, Vec<Arc<Peer>>> {
        self.peers.read()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn fiber_started(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn fiber_finished(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &self.all_done;
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            cvar.notify_all();
        }
    }

    /// Block the calling OS thread until every spawned fiber finished.
    pub fn wait_idle(&self) {
        let (lock, cvar) = &self.all_done;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.active() > 0 {
            guard = cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake one sleeping scheduler other than `except`, so freshly queued
    /// work gets picked up or stolen.
    pub fn notify_idle(&self, except: &Arc<Peer>) {
        let peers = self.peers.read();
        if let Some(peer) = peers
            .iter()
            .find(|p| !Arc::ptr_eq(p, except) && p.is_sleeping())
        {
            peer.unpark();
        }
    }

    /// Queue a new fiber from a thread outside this pool.
    pub fn inject(&self, fiber: Arc<Fiber>) {
        let id = fiber.id();
        self.fiber_started();
        self.injector.push(fiber);
        log::trace!("injected {} ({} queued)", id, self.injector.len());
        let peers = self.peers.read();
        match peers.iter().find(|p| p.is_sleeping()) {
            Some(peer) => peer.unpark(),
            None => {
                if let Some(peer) = peers.first() {
                    peer.unpark();
                }
            }
        }
    }

    /// Hold a worker's main fiber until shutdown. If shutdown already
    /// started, the main fiber goes straight back to ready.
    pub fn park(&self, main: Arc<Fiber>, scheduler: &Scheduler) {
        if !main.is_main() {
            fatal!("{} parked on the pool but is not a main fiber", main.id());
        }
        let mut parked = self.parked.lock();
        if self.shutdown.load(Ordering::Acquire) {
            drop(parked);
            scheduler.re_schedule(main);
            return;
        }
        main.link(Link::Wait);
        parked.push(main);
    }

    /// Release every parked worker main fiber.
    pub fn begin_shutdown(&self) {
        let released: Vec<_> = {
            let mut parked = self.parked.lock();
            self.shutdown.store(true, Ordering::Release);
            parked.drain(..).collect()
        };
        log::debug!("shutting down pool, releasing {} workers", released.len());
        for main in released {
            main.unlink(Link::Wait);
            scheduler::wake(main);
        }
    }
}

/// A pool of worker threads running fibers.
///
/// ```no_run
/// use weft_rt::{Config, Runtime};
///
/// let rt = Runtime::new(Config::default().with_workers(4))?;
/// let answer = rt.block_on(|| 6 * 7)?;
/// assert_eq!(answer, 42);
/// # Ok::<(), weft_rt::FiberError>(())
/// ```
pub struct Runtime {
    pool: Arc<Pool>,
    workers: Mutex<Vec<ThreadHandle<()>>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self, FiberError> {
        let stacks = allocator_for(config.protected_stacks);
        Self::with_stack_allocator(config, stacks)
    }

    /// Runtime whose fiber stacks come from `stacks`.
    pub fn with_stack_allocator(
        config: Config,
        stacks: Arc<dyn StackAllocator>,
    ) -> Result<Self, FiberError> {
        let count = config.worker_count();
        let pool = Pool::new(config, stacks);
        let runtime = Self {
            pool,
            workers: Mutex::new(Vec::with_capacity(count)),
        };

        // Every worker reports its bootstrap exactly once.
        let (report, reports) = mpsc::channel();
        for id in 0..count {
            let pool = runtime.pool.clone();
            let report = report.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", id))
                .spawn(move || worker_main(pool, id, report))
                .map_err(FiberError::WorkerSpawn)?;
            runtime
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        drop(report);

        for _ in 0..count {
            let booted = reports.recv().unwrap_or_else(|_| {
                Err(FiberError::WorkerSpawn(io::Error::other(
                    "worker exited before reporting its bootstrap",
                )))
            });
            if let Err(e) = booted {
                log::error!("runtime failed to start: {}", e);
                runtime.shutdown();
                return Err(e);
            }
        }
        log::info!("runtime started with {} workers", count);
        Ok(runtime)
    }

    pub fn config(&self) -> &Config {
        self.pool.config()
    }

    /// Number of fibers spawned on this runtime that have not finished.
    pub fn active_fibers(&self) -> usize {
        self.pool.active()
    }

    /// Run `f` in a new fiber on this runtime.
    pub fn spawn<T, F>(&self, f: F) -> Result<JoinHandle<T>, FiberError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Builder::new().spawn_in(&self.pool, f)
    }

    /// Spawn `f` and wait for its result.
    pub fn block_on<T, F>(&self, f: F) -> Result<T, FiberError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.spawn(f)?.join()?)
    }

    /// Wait for every fiber to finish, then stop the workers. Idempotent.
    pub fn shutdown(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }
        self.pool.wait_idle();
        self.pool.begin_shutdown();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        log::info!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(pool: Arc<Pool>, id: usize, report: Sender<Result<(), FiberError>>) {
    let booted = match scheduler::bootstrap_in(&pool) {
        Ok(ctx) => {
            log::debug!("worker {} running scheduler {}", id, ctx.scheduler);
            Ok(())
        }
        Err(e) => {
            log::error!("worker {} failed to bootstrap: {}", id, e);
            Err(e)
        }
    };
    let parked = booted.is_ok();
    // The receiver is gone if startup already failed elsewhere.
    let _ = report.send(booted);
    drop(report);
    if parked {
        scheduler::park_main();
    }
    log::debug!("worker {} exiting", id);
}
