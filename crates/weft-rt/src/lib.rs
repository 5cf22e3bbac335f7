// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Weft fiber runtime.
//!
//! Stackful, cooperatively scheduled fibers multiplexed over OS threads.
//! Each thread runs one scheduler; a per-thread dispatcher fiber picks the
//! next ready fiber and idle schedulers steal from busy ones.
//!
//! Components:
//! - `fiber`     : control block, queue membership, wait list
//! - `queue`     : work-stealing ready queue + injector
//! - `scheduler` : per-thread scheduler, dispatcher, active fiber
//! - `runtime`   : worker pool, shutdown
//! - `handle`    : Builder / spawn / JoinHandle
//! - `stack`     : stack providers
//! - `context`   : execution-point switch (ucontext)
//!
//! ```no_run
//! let handle = weft_rt::spawn(|| {
//!     weft_rt::yield_now();
//!     21 * 2
//! });
//! assert_eq!(handle.join().unwrap(), 42);
//! ```
//!
//! Control blocks and queues stay inside the crate; callers only see fiber
//! ids.
//!
//! ```compile_fail
//! let queue = weft_rt::queue::WorkStealingQueue::new();
//! ```

mod context;
mod fiber;
mod queue;
mod scheduler;
pub mod config;
pub mod error;
pub mod handle;
pub mod runtime;
pub mod stack;

pub use config::Config;
pub use error::{FiberError, JoinError};
pub use fiber::FiberId;
pub use handle::{spawn, Builder, JoinHandle};
pub use runtime::Runtime;
pub use scheduler::{bootstrap, current_id, yield_now, ThreadContext};
pub use stack::{FixedSizeStack, ProtectedStack, StackAllocator, StackMemory, MIN_STACK_SIZE};
