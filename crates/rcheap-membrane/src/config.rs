//! Runtime configuration.
//!
//! Settings are read from the environment on first use and cached for the
//! life of the process:
//! - `RCHEAP_LOG`: minimum level retained by the structured log
//!   (`off|error|warn|info|debug|trace`, default `warn`).
//! - `RCHEAP_LOG_STDERR`: when truthy (`1|true|yes|on`), retained records are
//!   also written to stderr as JSON lines.
//! - `RCHEAP_REALLOC_REUSE_FACTOR`: upper multiplier of the aligned realloc
//!   reuse window (integer >= 1, default 4).
//!
//! Programmatic setters override whatever the environment said.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::log::LogLevel;

// 0 = unresolved, u32::MAX = resolving, anything else = value + 1.
const UNRESOLVED: u32 = 0;
const RESOLVING: u32 = u32::MAX;

/// A process-wide setting resolved once from the environment.
///
/// Uses a non-blocking state machine instead of `OnceLock`: an installed
/// allocation hook may log while `std::env::var` is still running, and a
/// reentrant caller must get the default rather than wait on itself.
struct EnvCache {
    state: AtomicU32,
}

impl EnvCache {
    const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNRESOLVED),
        }
    }

    fn get(&self, default: u32, resolve: impl FnOnce() -> u32) -> u32 {
        let cached = self.state.load(Ordering::Acquire);
        if cached != UNRESOLVED && cached != RESOLVING {
            return cached - 1;
        }
        if cached == RESOLVING {
            return default;
        }
        if self
            .state
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            let v = self.state.load(Ordering::Acquire);
            return if v != UNRESOLVED && v != RESOLVING {
                v - 1
            } else {
                default
            };
        }
        let value = resolve().min(RESOLVING - 2);
        match self.state.compare_exchange(
            RESOLVING,
            value + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => value,
            // A setter ran while the environment was being read.
            Err(set) => set - 1,
        }
    }

    fn set(&self, value: u32) {
        self.state
            .store(value.min(RESOLVING - 2) + 1, Ordering::Release);
    }

    #[cfg(test)]
    fn swap_raw(&self, raw: u32) -> u32 {
        self.state.swap(raw, Ordering::SeqCst)
    }
}

static LOG_LEVEL: EnvCache = EnvCache::new();
static LOG_STDERR: EnvCache = EnvCache::new();
static REUSE_FACTOR: EnvCache = EnvCache::new();

const LEVEL_OFF: u32 = 0;
const DEFAULT_LEVEL: Option<LogLevel> = Some(LogLevel::Warn);

fn level_to_u32(level: Option<LogLevel>) -> u32 {
    match level {
        None => LEVEL_OFF,
        Some(LogLevel::Trace) => 1,
        Some(LogLevel::Debug) => 2,
        Some(LogLevel::Info) => 3,
        Some(LogLevel::Warn) => 4,
        Some(LogLevel::Error) => 5,
        Some(LogLevel::Fatal) => 6,
    }
}

fn u32_to_level(v: u32) -> Option<LogLevel> {
    match v {
        LEVEL_OFF => None,
        1 => Some(LogLevel::Trace),
        2 => Some(LogLevel::Debug),
        3 => Some(LogLevel::Info),
        5 => Some(LogLevel::Error),
        6 => Some(LogLevel::Fatal),
        _ => Some(LogLevel::Warn),
    }
}

/// Parse a log threshold (case-insensitive). `None` means logging is off.
///
/// Unknown values fall back to `warn`.
#[must_use]
pub fn parse_log_level(raw: &str) -> Option<LogLevel> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "0" | "disabled" => None,
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        "fatal" => Some(LogLevel::Fatal),
        _ => DEFAULT_LEVEL,
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Minimum level retained by the structured log, or `None` when disabled.
#[must_use]
pub fn log_level() -> Option<LogLevel> {
    let raw = LOG_LEVEL.get(level_to_u32(DEFAULT_LEVEL), || {
        let level = std::env::var("RCHEAP_LOG")
            .map(|v| parse_log_level(&v))
            .unwrap_or(DEFAULT_LEVEL);
        level_to_u32(level)
    });
    u32_to_level(raw)
}

/// Override the log threshold. `None` disables logging.
pub fn set_log_level(level: Option<LogLevel>) {
    LOG_LEVEL.set(level_to_u32(level));
}

/// Whether retained log records are mirrored to stderr.
#[must_use]
pub fn log_to_stderr() -> bool {
    LOG_STDERR.get(0, || {
        std::env::var("RCHEAP_LOG_STDERR")
            .map(|v| u32::from(parse_flag(&v)))
            .unwrap_or(0)
    }) != 0
}

/// Enable or disable mirroring log records to stderr.
pub fn set_log_to_stderr(enabled: bool) {
    LOG_STDERR.set(u32::from(enabled));
}

/// Reuse window of the aligned reallocator.
///
/// A reallocation keeps its current block when
/// `prev_request <= new_request < reuse_factor * prev_request` (and the new
/// size still fits the block). A factor of 1 disables reuse entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReallocPolicy {
    /// Upper multiplier of the reuse window.
    pub reuse_factor: u32,
}

impl ReallocPolicy {
    /// Factor used when nothing is configured.
    pub const DEFAULT_REUSE_FACTOR: u32 = 4;

    /// Policy with the default window.
    pub const DEFAULT: Self = Self {
        reuse_factor: Self::DEFAULT_REUSE_FACTOR,
    };

    /// Policy that never keeps a block on reallocation.
    pub const NEVER_REUSE: Self = Self { reuse_factor: 1 };

    /// Build a policy, clamping the factor to at least 1.
    #[must_use]
    pub const fn new(reuse_factor: u32) -> Self {
        Self {
            reuse_factor: if reuse_factor == 0 { 1 } else { reuse_factor },
        }
    }

    /// Whether a request growing from `prev_request` to `new_request` bytes
    /// falls inside the reuse window.
    #[must_use]
    pub const fn in_reuse_window(self, prev_request: usize, new_request: usize) -> bool {
        prev_request <= new_request
            && new_request < prev_request.saturating_mul(self.reuse_factor as usize)
    }
}

impl Default for ReallocPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_reuse_factor(raw: &str) -> u32 {
    match raw.trim().parse::<u32>() {
        Ok(v) if v >= 1 => v,
        _ => ReallocPolicy::DEFAULT_REUSE_FACTOR,
    }
}

/// The process-wide realloc policy (env on first call, cached thereafter).
#[must_use]
pub fn realloc_policy() -> ReallocPolicy {
    let factor = REUSE_FACTOR.get(ReallocPolicy::DEFAULT_REUSE_FACTOR, || {
        std::env::var("RCHEAP_REALLOC_REUSE_FACTOR")
            .map(|v| parse_reuse_factor(&v))
            .unwrap_or(ReallocPolicy::DEFAULT_REUSE_FACTOR)
    });
    ReallocPolicy::new(factor)
}

/// Replace the process-wide realloc policy.
pub fn set_realloc_policy(policy: ReallocPolicy) {
    REUSE_FACTOR.set(ReallocPolicy::new(policy.reuse_factor).reuse_factor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_levels() {
        assert_eq!(parse_log_level("trace"), Some(LogLevel::Trace));
        assert_eq!(parse_log_level("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(parse_log_level(" info "), Some(LogLevel::Info));
        assert_eq!(parse_log_level("warning"), Some(LogLevel::Warn));
        assert_eq!(parse_log_level("error"), Some(LogLevel::Error));
        assert_eq!(parse_log_level("off"), None);
        assert_eq!(parse_log_level("none"), None);
        assert_eq!(parse_log_level("bogus"), Some(LogLevel::Warn));
    }

    #[test]
    fn level_encoding_is_lossless() {
        for level in [
            None,
            Some(LogLevel::Trace),
            Some(LogLevel::Debug),
            Some(LogLevel::Info),
            Some(LogLevel::Warn),
            Some(LogLevel::Error),
            Some(LogLevel::Fatal),
        ] {
            assert_eq!(u32_to_level(level_to_u32(level)), level);
        }
    }

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn reuse_factor_parser_rejects_zero_and_garbage() {
        assert_eq!(parse_reuse_factor("8"), 8);
        assert_eq!(parse_reuse_factor("1"), 1);
        assert_eq!(parse_reuse_factor("0"), ReallocPolicy::DEFAULT_REUSE_FACTOR);
        assert_eq!(parse_reuse_factor("-3"), ReallocPolicy::DEFAULT_REUSE_FACTOR);
        assert_eq!(parse_reuse_factor("x"), ReallocPolicy::DEFAULT_REUSE_FACTOR);
    }

    #[test]
    fn reuse_window_bounds() {
        let policy = ReallocPolicy::DEFAULT;
        assert!(policy.in_reuse_window(100, 100));
        assert!(policy.in_reuse_window(100, 399));
        assert!(!policy.in_reuse_window(100, 400));
        assert!(!policy.in_reuse_window(100, 99));
        assert!(!ReallocPolicy::NEVER_REUSE.in_reuse_window(100, 100));
        assert_eq!(ReallocPolicy::new(0), ReallocPolicy::NEVER_REUSE);
    }

    #[test]
    fn env_cache_is_sticky_and_settable() {
        let cache = EnvCache::new();
        assert_eq!(cache.get(9, || 3), 3);
        assert_eq!(cache.get(9, || 7), 3);
        cache.set(5);
        assert_eq!(cache.get(9, || 7), 5);
    }

    #[test]
    fn setter_during_resolution_wins() {
        let cache = EnvCache::new();
        assert_eq!(
            cache.get(9, || {
                cache.set(5);
                3
            }),
            5
        );
        assert_eq!(cache.get(9, || 7), 5);
    }

    #[test]
    fn resolving_state_returns_default() {
        let cache = EnvCache::new();
        cache.swap_raw(RESOLVING);
        assert_eq!(cache.get(42, || 1), 42);
    }
}
