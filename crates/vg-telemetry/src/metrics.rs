use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs distinguishing counter
/// families (e.g. `channel=slack`, `status=429`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    fn json_key(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-local counters and duration sums, exposed as JSON via the
/// `/api/metrics` endpoint. Quota counters live in `vg-harness`; this is
/// observability only.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    // Durations accumulate as micros so an atomic integer suffices.
    duration_micros: RwLock<AHashMap<String, (AtomicU64, AtomicU64)>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn record_duration(&self, name: &str, seconds: f64) {
        let micros = (seconds * 1e6) as u64;
        {
            let durations = self.duration_micros.read().unwrap_or_else(|e| e.into_inner());
            if let Some((sum, count)) = durations.get(name) {
                sum.fetch_add(micros, Ordering::Relaxed);
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut durations = self.duration_micros.write().unwrap_or_else(|e| e.into_inner());
        let (sum, count) = durations
            .entry(name.to_string())
            .or_insert_with(|| (AtomicU64::new(0), AtomicU64::new(0)));
        sum.fetch_add(micros, Ordering::Relaxed);
        count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of everything, for the metrics endpoint.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        let mut counter_map = serde_json::Map::new();
        for ((name, labels), value) in counters.iter() {
            let key = format!("{name}{}", labels.json_key());
            counter_map.insert(key, value.load(Ordering::Relaxed).into());
        }

        let durations = self.duration_micros.read().unwrap_or_else(|e| e.into_inner());
        let mut duration_map = serde_json::Map::new();
        for (name, (sum, count)) in durations.iter() {
            let count = count.load(Ordering::Relaxed);
            let sum_secs = sum.load(Ordering::Relaxed) as f64 / 1e6;
            duration_map.insert(
                name.clone(),
                serde_json::json!({
                    "count": count,
                    "sum_seconds": sum_secs,
                    "avg_seconds": if count > 0 { sum_secs / count as f64 } else { 0.0 },
                }),
            );
        }

        serde_json::json!({ "counters": counter_map, "durations": duration_map })
    }
}

/// Process-wide collector handle.
pub fn global_metrics() -> &'static MetricsCollector {
    static METRICS: OnceLock<MetricsCollector> = OnceLock::new();
    METRICS.get_or_init(MetricsCollector::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = MetricsCollector::new();
        m.increment_counter("events_ingested_total", &[("env", "production")]);
        m.increment_counter("events_ingested_total", &[("env", "production")]);
        m.increment_counter("events_ingested_total", &[("env", "staging")]);
        assert_eq!(
            m.counter_value("events_ingested_total", &[("env", "production")]),
            2
        );
        assert_eq!(
            m.counter_value("events_ingested_total", &[("env", "staging")]),
            1
        );
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter("x", &[("a", "1"), ("b", "2")]);
        assert_eq!(m.counter_value("x", &[("b", "2"), ("a", "1")]), 1);
    }

    #[test]
    fn snapshot_includes_durations() {
        let m = MetricsCollector::new();
        m.record_duration("ingest_seconds", 0.25);
        m.record_duration("ingest_seconds", 0.75);
        let snap = m.snapshot_json();
        let d = &snap["durations"]["ingest_seconds"];
        assert_eq!(d["count"], 2);
        assert!((d["avg_seconds"].as_f64().unwrap() - 0.5).abs() < 1e-6);
    }
}
