// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawning fibers and joining them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{panic_message, FiberError, JoinError};
use crate::fiber::{Body, Fiber, FiberId};
use crate::runtime::Pool;
use crate::scheduler::{self, with_scheduler};
use crate::stack::Stack;

/// Where a fiber body leaves its outcome for the joiner.
struct ResultSlot<T> {
    value: spin::Mutex<Option<Result<T, JoinError>>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            value: spin::Mutex::new(None),
        }
    }

    fn set(&self, result: Result<T, JoinError>) {
        *self.value.lock() = Some(result);
    }

    fn take(&self) -> Option<Result<T, JoinError>> {
        self.value.lock().take()
    }
}

/// Fiber factory with per-fiber settings.
///
/// ```no_run
/// let handle = weft_rt::Builder::new()
///     .name("ticker")
///     .stack_size(32 * 1024)
///     .spawn(|| 1 + 1)?;
/// assert_eq!(handle.join()?, 2);
/// # Ok::<(), weft_rt::FiberError>(())
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    pinned: bool,
    dispatch: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Usable stack bytes. Defaults to the runtime's configured size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Keep the fiber on the scheduler that first runs it.
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Start the fiber right away instead of queueing it. The spawning
    /// fiber goes to the back of its ready queue and `spawn` returns once
    /// it is resumed. Keeps recursive fan-outs depth first.
    pub fn dispatch(mut self, dispatch: bool) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Spawn on the calling thread's scheduler, bootstrapping one if the
    /// thread has none yet.
    pub fn spawn<T, F>(self, f: F) -> Result<JoinHandle<T>, FiberError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        scheduler::bootstrap()?;
        let pool = with_scheduler(|s| s.pool().clone());
        let dispatch = self.dispatch;
        let (fiber, result) = self.build(&pool, f)?;
        if dispatch {
            scheduler::launch_now(fiber.clone());
        } else {
            with_scheduler(|s| s.attach_new_fiber(fiber.clone()));
        }
        Ok(JoinHandle::new(fiber, result))
    }

    /// Spawn on `pool`: locally when the calling thread belongs to it,
    /// through the injector otherwise.
    pub(crate) fn spawn_in<T, F>(self, pool: &Arc<Pool>, f: F) -> Result<JoinHandle<T>, FiberError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (fiber, result) = self.build(pool, f)?;
        let local = scheduler::try_with_scheduler(|s| {
            if Arc::ptr_eq(s.pool(), pool) {
                s.attach_new_fiber(fiber.clone());
                true
            } else {
                false
            }
        })
        .unwrap_or(false);
        if !local {
            pool.inject(fiber.clone());
        }
        Ok(JoinHandle::new(fiber, result))
    }

    fn build<T, F>(self, pool: &Pool, f: F) -> Result<(Arc<Fiber>, Arc<ResultSlot<T>>), FiberError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let result = Arc::new(ResultSlot::new());
        let slot = result.clone();
        let body: Body = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| JoinError::Panicked(panic_message(payload)));
            slot.set(outcome);
        });

        let size = self.stack_size.unwrap_or(pool.config().stack_size);
        let stack = Stack::allocate(pool.stacks().clone(), size)?;
        let fiber = Fiber::worker(body, stack, scheduler::fiber_entry, self.pinned, self.name)?;
        Ok((fiber, result))
    }
}

/// Spawn `f` on the calling thread's scheduler with default settings.
///
/// # Panics
/// If the fiber's stack cannot be allocated. Use [`Builder::spawn`] to
/// handle that case.
pub fn spawn<T, F>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn fiber")
}

/// Owned permission to join a fiber. Dropping it detaches the fiber.
pub struct JoinHandle<T> {
    fiber: Arc<Fiber>,
    result: Arc<ResultSlot<T>>,
}

impl<T> JoinHandle<T> {
    fn new(fiber: Arc<Fiber>, result: Arc<ResultSlot<T>>) -> Self {
        Self { fiber, result }
    }

    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.fiber.name()
    }

    pub fn is_finished(&self) -> bool {
        self.fiber.is_finished()
    }

    /// Suspend the calling fiber until this one terminates, then take its
    /// result. Called from a plain thread, the thread's main fiber waits.
    pub fn join(self) -> Result<T, JoinError> {
        scheduler::suspend_and_wait(&self.fiber);
        self.result
            .take()
            .unwrap_or_else(|| Err(JoinError::Panicked("fiber finished without a result".into())))
    }

    /// Let the fiber run to completion on its own.
    pub fn detach(self) {}
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("fiber", &self.fiber)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::tests::{in_child, rerun};
    use crate::stack::MIN_STACK_SIZE;

    #[test]
    fn join_returns_value() {
        let h = spawn(|| "done".to_string());
        assert_eq!(h.join().unwrap(), "done");
    }

    #[test]
    fn join_after_finish_does_not_block() {
        let h = spawn(|| 5);
        crate::yield_now();
        assert!(h.is_finished());
        assert_eq!(h.join().unwrap(), 5);
    }

    #[test]
    fn panic_becomes_join_error() {
        // Room for the panic hook to format a backtrace.
        let h = Builder::new()
            .stack_size(512 * 1024)
            .spawn(|| -> () { panic!("bad fiber") })
            .unwrap();
        assert_eq!(h.join(), Err(JoinError::Panicked("bad fiber".into())));
        // The scheduler keeps working.
        assert_eq!(spawn(|| 1).join().unwrap(), 1);
    }

    #[test]
    fn builder_names_and_sizes() {
        let h = Builder::new()
            .name("worker-a")
            .stack_size(MIN_STACK_SIZE)
            .spawn(|| ())
            .unwrap();
        assert_eq!(h.name(), Some("worker-a"));
        h.join().unwrap();
    }

    #[test]
    fn undersized_stack_is_an_error_not_a_crash() {
        let err = Builder::new().stack_size(64).spawn(|| ()).unwrap_err();
        assert!(matches!(err, FiberError::InvalidStackSize { size: 64, .. }));
        assert_eq!(spawn(|| 3).join().unwrap(), 3);
    }

    #[test]
    fn nested_spawn_and_join() {
        let total = spawn(|| {
            let inner: Vec<_> = (1..=4).map(|i| spawn(move || i * 10)).collect();
            inner.into_iter().map(|h| h.join().unwrap()).sum::<i32>()
        })
        .join()
        .unwrap();
        assert_eq!(total, 100);
    }

    #[test]
    fn dropped_handle_detaches() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        drop(spawn(move || seen.store(true, std::sync::atomic::Ordering::SeqCst)));
        crate::yield_now();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn failed_lazy_bootstrap_is_returned() {
        if in_child() {
            // The dispatcher stack comes from WEFT_STACK_SIZE, which is too small.
            let err = Builder::new().stack_size(32 * 1024).spawn(|| ()).unwrap_err();
            assert!(matches!(err, FiberError::InvalidStackSize { size: 100, .. }));
            // Nothing was half installed; the next attempt fails the same way.
            assert!(matches!(
                scheduler::bootstrap(),
                Err(FiberError::InvalidStackSize { size: 100, .. })
            ));
            return;
        }
        let output = rerun(
            "handle::tests::failed_lazy_bootstrap_is_returned",
            &[("WEFT_STACK_SIZE", "100")],
        );
        assert!(
            output.status.success(),
            "child failed: {:?}\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    #[test]
    fn dispatched_spawn_from_a_plain_thread() {
        let h = Builder::new().dispatch(true).spawn(|| 6 * 7).unwrap();
        assert!(h.is_finished());
        assert_eq!(h.join().unwrap(), 42);
    }
}
