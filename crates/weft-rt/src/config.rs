// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime tunables.
//!
//! All knobs can be set programmatically via [`configure`] before the
//! runtime starts, or through environment variables (`WEFT_SCHED_NUM`,
//! `WEFT_STACK_NUM`, `WEFT_STACK_SIZE`, `WEFT_SCHED_LOG`). Invalid
//! values are normalized rather than rejected: the scheduler count is
//! clamped to the CPU count, the stack count is forced to a power of
//! two, and the stack size is rounded up to a whole page.

use std::thread;

use once_cell::sync::OnceCell;

const PAGE: usize = 4096;
const DEFAULT_STACK_NUM: u32 = 8;
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Tunables for the scheduler pool. `Default` reads the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of scheduler threads. 0 means one per CPU core.
    pub sched_num: u32,
    /// Stack slots per scheduler. Must be a power of two.
    pub stack_num: u32,
    /// Bytes per coroutine stack slot.
    pub stack_size: usize,
    /// Emit scheduler trace logs (`log::trace!`, target `weft::sched`).
    pub sched_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sched_num: env_u32("WEFT_SCHED_NUM").unwrap_or(0),
            stack_num: env_u32("WEFT_STACK_NUM").unwrap_or(DEFAULT_STACK_NUM),
            stack_size: env_u32("WEFT_STACK_SIZE")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_STACK_SIZE),
            sched_log: env_u32("WEFT_SCHED_LOG").unwrap_or(0) != 0,
        }
    }
}

impl Config {
    /// Clamp every field into its supported range.
    pub(crate) fn normalized(mut self) -> Self {
        let ncpu = cpu_num();
        if self.sched_num == 0 || self.sched_num > ncpu {
            self.sched_num = ncpu;
        }
        if self.stack_num == 0 || !self.stack_num.is_power_of_two() {
            self.stack_num = DEFAULT_STACK_NUM;
        }
        if self.stack_size == 0 {
            self.stack_size = DEFAULT_STACK_SIZE;
        }
        self.stack_size = (self.stack_size + PAGE - 1) & !(PAGE - 1);
        self
    }
}

/// Error returned by [`configure`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The scheduler pool has already been created; tunables are fixed.
    #[error("runtime already configured or started")]
    AlreadyConfigured,
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Install tunables for the runtime. Must be called before the first
/// coroutine is spawned; later calls fail with
/// [`ConfigError::AlreadyConfigured`].
pub fn configure(config: Config) -> Result<(), ConfigError> {
    CONFIG
        .set(config.normalized())
        .map_err(|_| ConfigError::AlreadyConfigured)
}

/// The configuration the scheduler manager will start with.
pub(crate) fn effective() -> Config {
    CONFIG
        .get_or_init(|| Config::default().normalized())
        .clone()
}

pub(crate) fn cpu_num() -> u32 {
    thread::available_parallelism().map(|p| p.get() as u32).unwrap_or(4)
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_sched_num() {
        let cfg = Config {
            sched_num: u32::MAX,
            stack_num: 8,
            stack_size: DEFAULT_STACK_SIZE,
            sched_log: false,
        }
        .normalized();
        assert_eq!(cfg.sched_num, cpu_num());
    }

    #[test]
    fn normalize_fixes_stack_num() {
        let cfg = Config {
            sched_num: 1,
            stack_num: 7,
            stack_size: 0,
            sched_log: false,
        }
        .normalized();
        assert_eq!(cfg.stack_num, DEFAULT_STACK_NUM);
        assert_eq!(cfg.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn normalize_rounds_stack_size_to_page() {
        let cfg = Config {
            sched_num: 1,
            stack_num: 8,
            stack_size: PAGE + 1,
            sched_log: false,
        }
        .normalized();
        assert_eq!(cfg.stack_size % PAGE, 0);
        assert!(cfg.stack_size > PAGE);
    }
}
