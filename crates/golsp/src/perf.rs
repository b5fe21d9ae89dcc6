// perf.rs - Performance timing infrastructure for golsp
//
// Timing instrumentation for unit loads, import-graph builds and workspace
// searches. Controlled via the GOLSP_PERF environment variable.
//
// Usage:
//   GOLSP_PERF=1 golsp --stdio       # Enable basic timing logs
//   GOLSP_PERF=verbose golsp --stdio # Also warn when thresholds are exceeded

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PERF_ENABLED: OnceLock<bool> = OnceLock::new();
static PERF_VERBOSE: OnceLock<bool> = OnceLock::new();

/// Check if performance timing is enabled
pub fn is_enabled() -> bool {
    *PERF_ENABLED.get_or_init(|| {
        std::env::var("GOLSP_PERF")
            .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
            .unwrap_or(false)
    })
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    *PERF_VERBOSE.get_or_init(|| {
        std::env::var("GOLSP_PERF")
            .map(|v| v.to_lowercase() == "verbose")
            .unwrap_or(false)
    })
}

/// RAII timing guard that logs duration on drop
///
/// ```
/// use golsp::perf::TimingGuard;
///
/// let _guard = TimingGuard::new("operation_name");
/// // ... do work ...
/// // Duration logged when _guard goes out of scope
/// ```
pub struct TimingGuard {
    start: Instant,
    name: Cow<'static, str>,
    threshold_warn_ms: Option<u64>,
    enabled: bool,
}

impl TimingGuard {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
            threshold_warn_ms: None,
            enabled: is_enabled(),
        }
    }

    /// Create a timing guard that warns (in verbose mode) when the scope
    /// takes longer than `threshold_ms`.
    pub fn with_threshold(name: impl Into<Cow<'static, str>>, threshold_ms: u64) -> Self {
        let mut guard = Self::new(name);
        guard.threshold_warn_ms = Some(threshold_ms);
        guard
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Complete the timing without logging and return the duration.
    pub fn finish(mut self) -> Duration {
        self.enabled = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }

        let elapsed = self.start.elapsed();
        log::info!("[PERF] {} completed in {:?}", self.name, elapsed);

        if let Some(threshold) = self.threshold_warn_ms {
            if elapsed.as_millis() > threshold as u128 && is_verbose() {
                log::warn!(
                    "[PERF] {} exceeded threshold ({}ms > {}ms)",
                    self.name,
                    elapsed.as_millis(),
                    threshold
                );
            }
        }
    }
}

static UNIT_LOADS: AtomicUsize = AtomicUsize::new(0);
static SUMMARY_LOADS: AtomicUsize = AtomicUsize::new(0);
static LOAD_MICROS: AtomicU64 = AtomicU64::new(0);

/// Record a completed full unit load
pub fn record_unit_load(duration: Duration) {
    UNIT_LOADS.fetch_add(1, Ordering::Relaxed);
    LOAD_MICROS.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
}

/// Record a completed package summary load
pub fn record_summary_load() {
    SUMMARY_LOADS.fetch_add(1, Ordering::Relaxed);
}

/// Process-wide load counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounters {
    pub unit_loads: usize,
    pub summary_loads: usize,
    pub total_load_time: Duration,
}

pub fn load_counters() -> LoadCounters {
    LoadCounters {
        unit_loads: UNIT_LOADS.load(Ordering::Relaxed),
        summary_loads: SUMMARY_LOADS.load(Ordering::Relaxed),
        total_load_time: Duration::from_micros(LOAD_MICROS.load(Ordering::Relaxed)),
    }
}

/// Log the load counters (no-op unless GOLSP_PERF is set)
pub fn log_summary(context: &str) {
    if !is_enabled() {
        return;
    }
    let counters = load_counters();
    log::info!(
        "[PERF] {}: {} unit loads ({:?} total), {} summary loads",
        context,
        counters.unit_loads,
        counters.total_load_time,
        counters.summary_loads
    );
}
