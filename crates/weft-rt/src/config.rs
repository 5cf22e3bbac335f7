// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults, builder-style setters, and `WEFT_*` environment overrides.

use std::thread;
use std::time::Duration;

/// Default usable stack per fiber.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// How many empty polls the dispatcher spins through before parking.
pub const DEFAULT_IDLE_SPINS: u32 = 64;

/// Upper bound on a single idle park. Wakers unpark explicitly, the
/// timeout only bounds how late a steal opportunity is noticed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5);

/// Settings for a [`Runtime`](crate::Runtime) and for lazily bootstrapped threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Worker threads. 0 means one per available core.
    pub workers: usize,
    /// Usable stack bytes per fiber (dispatcher included).
    pub stack_size: usize,
    /// Allocate stacks with a guard page below them.
    pub protected_stacks: bool,
    pub idle_spins: u32,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            stack_size: DEFAULT_STACK_SIZE,
            protected_stacks: false,
            idle_spins: DEFAULT_IDLE_SPINS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults overridden by `WEFT_WORKERS`, `WEFT_STACK_SIZE` and
    /// `WEFT_PROTECTED_STACKS`.
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var(&lookup, "WEFT_WORKERS") {
            self.workers = n;
        }
        if let Some(n) = parse_var(&lookup, "WEFT_STACK_SIZE") {
            self.stack_size = n;
        }
        if let Some(flag) = parse_var(&lookup, "WEFT_PROTECTED_STACKS") {
            self.protected_stacks = flag;
        }
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_protected_stacks(mut self, protected: bool) -> Self {
        self.protected_stacks = protected;
        self
    }

    pub fn with_idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Worker count with 0 resolved to the number of available cores.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = Config::default().apply_env(env(&[
            ("WEFT_WORKERS", "3"),
            ("WEFT_STACK_SIZE", "32768"),
            ("WEFT_PROTECTED_STACKS", "true"),
        ]));
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.stack_size, 32768);
        assert!(cfg.protected_stacks);
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let cfg = Config::default().apply_env(env(&[("WEFT_WORKERS", "many")]));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn zero_workers_means_available_parallelism() {
        assert!(Config::default().worker_count() >= 1);
        assert_eq!(Config::default().with_workers(2).worker_count(), 2);
    }
}
