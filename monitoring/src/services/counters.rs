use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::scheduler::PeriodicTask;

/// Longest endpoint key kept after normalization
pub const MAX_ENDPOINT_LEN: usize = 50;

/// Substrings of counter keys that survive compaction (reset to zero).
const PRESERVED_MARKERS: [&str; 3] = ["total", "errors", "status"];

static PHONE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?\d{10,15}$").expect("valid regex"));
static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));
static HEX_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9a-fA-F]{16,}|[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})$",
    )
    .expect("valid regex")
});

/// Collapse per-entity path segments so that `/users/42` and `/users/43`
/// share one key. Phone numbers become `:phone`, numeric and long hex/UUID
/// ids become `:id`, query strings are dropped and the result is capped at
/// [`MAX_ENDPOINT_LEN`] characters. Normalizing a normalized key is a no-op.
pub fn normalize_endpoint(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut current = truncate_chars(&replace_segments(path), MAX_ENDPOINT_LEN);

    // Truncation can leave a partial segment behind that matches a rule on the
    // next pass, so iterate until stable.
    for _ in 0..4 {
        let next = truncate_chars(&replace_segments(&current), MAX_ENDPOINT_LEN);
        if next == current {
            break;
        }
        current = next;
    }

    if current.is_empty() {
        "/".to_string()
    } else {
        current
    }
}

fn replace_segments(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if PHONE_SEGMENT.is_match(segment) {
                ":phone"
            } else if NUMERIC_SEGMENT.is_match(segment) || HEX_SEGMENT.is_match(segment) {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Counter keys fed by the ingress hooks
pub mod counter_keys {
    pub const REQUESTS_TOTAL: &str = "requests.total";
    pub const ERRORS_TOTAL: &str = "errors.total";
    pub const FILES_PROCESSED_TOTAL: &str = "files.processed.total";
    pub const FILES_ERRORS_TOTAL: &str = "files.errors.total";
}

/// What a compaction pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    pub removed: usize,
    pub reset: usize,
}

/// Named, additive-only counters.
#[derive(Debug)]
pub struct CounterStore {
    counters: DashMap<String, u64>,
    max_keys: usize,
}

impl CounterStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            counters: DashMap::new(),
            max_keys,
        }
    }

    pub fn increment(&self, key: &str) -> u64 {
        self.increment_by(key, 1)
    }

    pub fn increment_by(&self, key: &str, amount: u64) -> u64 {
        if let Some(mut value) = self.counters.get_mut(key) {
            *value = value.saturating_add(amount);
            return *value;
        }

        let mut value = self.counters.entry(key.to_string()).or_insert(0);
        *value = value.saturating_add(amount);
        *value
    }

    /// Current value; unknown keys read as zero.
    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Drop high-cardinality keys once the key count passes the limit.
    ///
    /// Keys containing `total`, `errors` or `status` are kept but zeroed so
    /// dashboards still find them. Returns `None` when under the limit.
    pub fn compact(&self) -> Option<CompactionSummary> {
        if self.counters.len() <= self.max_keys {
            return None;
        }

        let mut summary = CompactionSummary { removed: 0, reset: 0 };
        self.counters.retain(|key, value| {
            if PRESERVED_MARKERS.iter().any(|marker| key.contains(marker)) {
                *value = 0;
                summary.reset += 1;
                true
            } else {
                summary.removed += 1;
                false
            }
        });

        tracing::info!(
            removed = summary.removed,
            reset = summary.reset,
            max_keys = self.max_keys,
            "Counter store compacted"
        );

        Some(summary)
    }
}

/// Point-in-time values, replaced on every write.
#[derive(Debug, Default)]
pub struct GaugeStore {
    gauges: DashMap<String, f64>,
}

impl GaugeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: f64) {
        self.gauges.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).map(|v| *v)
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.gauges
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Periodic compaction of a [`CounterStore`].
pub struct CounterCompaction {
    store: Arc<CounterStore>,
    every: Duration,
}

impl CounterCompaction {
    pub fn new(store: Arc<CounterStore>, every: Duration) -> Self {
        Self { store, every }
    }
}

#[async_trait]
impl PeriodicTask for CounterCompaction {
    fn name(&self) -> &'static str {
        "counter_compaction"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.store.compact();
        Ok(())
    }
}
