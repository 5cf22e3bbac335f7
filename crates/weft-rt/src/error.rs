// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Two tiers: recoverable errors are returned to the immediate caller,
//! invariant violations abort the process through [`fatal!`].

use thiserror::Error;

/// Error raised while constructing fibers or runtimes.
#[derive(Debug, Error)]
pub enum FiberError {
    /// The stack provider could not supply memory.
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation { size: usize },

    /// Requested stack is smaller than the provider accepts.
    #[error("stack size {size} is below the minimum of {min} bytes")]
    InvalidStackSize { size: usize, min: usize },

    /// The execution point could not be initialized.
    #[error("failed to initialize execution context: {0}")]
    ContextInit(#[source] std::io::Error),

    /// An OS worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// The calling thread is already bound to another runtime.
    #[error("thread already belongs to a different runtime")]
    ForeignRuntime,

    /// The fiber ran but did not produce a value.
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Error returned by `join()` when the fiber did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// Fiber body panicked with the given message.
    #[error("fiber panicked: {0}")]
    Panicked(String),
}

/// Log and abort. Used for broken invariants where unwinding would leave
/// queues or wait lists inconsistent for every other thread.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        eprintln!("weft-rt fatal: {}", format_args!($($arg)+));
        ::std::process::abort()
    }};
}

pub(crate) use fatal;

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Output};

    const CHILD_VAR: &str = "WEFT_TEST_CHILD";

    /// True inside a test process started by [`rerun`].
    pub(crate) fn in_child() -> bool {
        std::env::var_os(CHILD_VAR).is_some()
    }

    /// Run the test at `path` alone in a fresh copy of this test binary.
    pub(crate) fn rerun(path: &str, env: &[(&str, &str)]) -> Output {
        let exe = std::env::current_exe().unwrap();
        Command::new(exe)
            .args([path, "--exact", "--nocapture", "--test-threads=1"])
            .env(CHILD_VAR, "1")
            .envs(env.iter().copied())
            .output()
            .unwrap()
    }

    /// The child died through `fatal!` with `message` on stderr.
    pub(crate) fn assert_aborted(output: &Output, message: &str) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert_eq!(
            output.status.signal(),
            Some(libc::SIGABRT),
            "child exited with {:?}, stderr:\n{}",
            output.status,
            stderr
        );
        assert!(stderr.contains("weft-rt fatal"), "stderr:\n{}", stderr);
        assert!(stderr.contains(message), "stderr:\n{}", stderr);
    }

    #[test]
    fn fatal_logs_and_aborts() {
        if in_child() {
            fatal!("queue {} corrupted", 3);
        }
        let output = rerun("error::tests::fatal_logs_and_aborts", &[]);
        assert_aborted(&output, "weft-rt fatal: queue 3 corrupted");
    }

    #[test]
    fn stack_error_mentions_size() {
        let err = FiberError::StackAllocation { size: 4096 };
        assert_eq!(err.to_string(), "failed to allocate a 4096-byte fiber stack");
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u32)), "unknown panic");
    }
}
