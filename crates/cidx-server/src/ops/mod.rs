//! Observability: per-tool call metrics, component health, and the
//! periodic self-monitoring sweep over recent logs.
//!
//! Counters live behind a lock-guarded `HashMap<String, u64>`, cheap to
//! snapshot on every `/api/admin/metrics` request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;

/// Call counters keyed by tool/endpoint name, plus per-search-mode
/// counts. Multi-repo fan-out searches increment the same counters a
/// single-repo search would.
#[derive(Default)]
pub struct Metrics {
    tool_calls: Mutex<HashMap<String, u64>>,
    search_mode_calls: Mutex<HashMap<String, u64>>,
    cumulative_search_ms: AtomicU64,
    search_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self, tool: &str) {
        *self.tool_calls.lock().entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn record_search(&self, mode: &str, elapsed_ms: u64) {
        *self.search_mode_calls.lock().entry(mode.to_string()).or_insert(0) += 1;
        self.cumulative_search_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.search_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let search_count = self.search_count.load(Ordering::Relaxed);
        let cumulative = self.cumulative_search_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            tool_calls: self.tool_calls.lock().clone(),
            search_mode_calls: self.search_mode_calls.lock().clone(),
            average_search_ms: if search_count == 0 { 0.0 } else { cumulative as f64 / search_count as f64 },
            search_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tool_calls: HashMap<String, u64>,
    pub search_mode_calls: HashMap<String, u64>,
    pub average_search_ms: f64,
    pub search_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Ready,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub database: ComponentStatus,
    pub job_queue: ComponentStatus,
    pub overall: ComponentStatus,
}

/// Checks whether the registry DB answers and the job queue is not
/// shut down.
pub async fn health_check(pool: &SqlitePool, queue_running: bool) -> HealthReport {
    let database = match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => ComponentStatus::Ready,
        Err(_) => ComponentStatus::Down,
    };
    let job_queue = if queue_running { ComponentStatus::Ready } else { ComponentStatus::Down };
    let overall = if database == ComponentStatus::Ready && job_queue == ComponentStatus::Ready {
        ComponentStatus::Ready
    } else if database == ComponentStatus::Down {
        ComponentStatus::Down
    } else {
        ComponentStatus::Degraded
    };
    HealthReport { database, job_queue, overall }
}

/// A single classified line from the self-monitoring sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPatternClass {
    TransientRetry,
    RepeatedPermissionDenial,
    Crash,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedLogPattern {
    pub class: LogPatternClass,
    pub sample_line: String,
    pub occurrences: usize,
}

/// Classifies recently-seen log lines. Crash-worthy patterns are the
/// only class the caller should escalate into an external ticket —
/// transient retries and permission-denial noise are expected traffic
/// at any scale and would otherwise flood a ticket queue.
pub fn classify_log_lines(lines: &[String]) -> Vec<ClassifiedLogPattern> {
    let mut by_class: HashMap<LogPatternClass, (usize, String)> = HashMap::new();
    for line in lines {
        let class = if line.contains("panicked at") || line.contains("PANIC") {
            LogPatternClass::Crash
        } else if line.contains("permission_denied") || line.contains("PermissionDenied") {
            LogPatternClass::RepeatedPermissionDenial
        } else if line.contains("retrying") || line.contains("external_failure") {
            LogPatternClass::TransientRetry
        } else {
            continue;
        };
        let entry = by_class.entry(class).or_insert((0, line.clone()));
        entry.0 += 1;
    }
    by_class
        .into_iter()
        .map(|(class, (occurrences, sample_line))| ClassifiedLogPattern { class, sample_line, occurrences })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_average_is_zero_with_no_searches() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().average_search_ms, 0.0);
    }

    #[test]
    fn metrics_tracks_calls_and_average_timing() {
        let metrics = Metrics::new();
        metrics.record_tool_call("search");
        metrics.record_tool_call("search");
        metrics.record_search("hybrid", 100);
        metrics.record_search("hybrid", 200);
        let snap = metrics.snapshot();
        assert_eq!(snap.tool_calls["search"], 2);
        assert_eq!(snap.average_search_ms, 150.0);
    }

    #[test]
    fn classify_flags_crash_lines_distinctly() {
        let lines = vec![
            "thread 'main' panicked at src/foo.rs:10".to_string(),
            "retrying embedding request".to_string(),
        ];
        let classified = classify_log_lines(&lines);
        assert!(classified.iter().any(|c| c.class == LogPatternClass::Crash));
        assert!(classified.iter().any(|c| c.class == LogPatternClass::TransientRetry));
    }
}
