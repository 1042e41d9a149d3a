//! Lightweight counters and timers for specialization and cache activity.
//!
//! Cache events are counted per name in a process-wide table and mirrored as `trace` events
//! under the `shapejit::cache` target. Compile scopes report their elapsed time at `debug`
//! when dropped.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

fn cache_counters() -> &'static Mutex<HashMap<&'static str, u64>> {
    static COUNTERS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Records one occurrence of a named cache event (`hit`, `miss`, `specialize`, ...).
#[inline]
pub fn cache_event(name: &'static str) {
    tracing::trace!(target: "shapejit::cache", event = name, "cache event");
    let mut counters = cache_counters().lock().expect("cache counters poisoned");
    *counters.entry(name).or_insert(0) += 1;
}

/// Number of times `name` was recorded since the last reset.
pub fn cache_event_count(name: &str) -> u64 {
    cache_counters()
        .lock()
        .expect("cache counters poisoned")
        .get(name)
        .copied()
        .unwrap_or(0)
}

/// Snapshot of every cache counter, sorted by name.
pub fn cache_event_counts() -> Vec<(&'static str, u64)> {
    let counters = cache_counters().lock().expect("cache counters poisoned");
    let mut rows: Vec<_> = counters.iter().map(|(name, count)| (*name, *count)).collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    rows
}

pub fn reset_cache_events() {
    cache_counters().lock().expect("cache counters poisoned").clear();
}

pub struct ScopeGuard {
    name: &'static str,
    start: Instant,
}

impl ScopeGuard {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            scope = self.name,
            elapsed_us = elapsed.as_micros() as u64,
            "compile scope finished"
        );
    }
}

#[inline]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        start: Instant::now(),
    }
}
