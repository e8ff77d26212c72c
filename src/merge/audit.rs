//! Counters and the post-commit event bus.
//!
//! Labels only ever carry strategy names and reason codes. Events only ever
//! carry ids.

use std::{
    fmt::Write as _,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::PatientMerged;

pub const MERGE_TOTAL: &str = "merge_total";
pub const MERGE_FAILED_TOTAL: &str = "merge_failed_total";

pub trait MergeMetrics: Send + Sync {
    /// Adds one to counter `name` with a single `label_key="label_value"` pair.
    fn incr(&self, name: &'static str, label_key: &'static str, label_value: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MergeMetrics for NoopMetrics {
    fn incr(&self, _name: &'static str, _label_key: &'static str, _label_value: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CounterKey {
    name: &'static str,
    label_key: &'static str,
    label_value: String,
}

/// In-process counter store, scraped through `GET /metrics`.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: DashMap<CounterKey, AtomicU64>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, name: &str, label_key: &str, label_value: &str) -> u64 {
        self.counters
            .iter()
            .find(|e| {
                let k = e.key();
                k.name == name && k.label_key == label_key && k.label_value == label_value
            })
            .map(|e| e.value().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition format, series sorted for stable output.
    pub fn render_prometheus(&self) -> String {
        let mut series: Vec<(CounterKey, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        let mut current: Option<&'static str> = None;
        for (key, value) in &series {
            if current != Some(key.name) {
                let _ = writeln!(out, "# TYPE {} counter", key.name);
                current = Some(key.name);
            }
            let _ = writeln!(
                out,
                "{}{{{}=\"{}\"}} {}",
                key.name,
                key.label_key,
                escape_label(&key.label_value),
                value
            );
        }
        out
    }
}

impl MergeMetrics for CounterRegistry {
    fn incr(&self, name: &'static str, label_key: &'static str, label_value: &str) {
        let key = CounterKey {
            name,
            label_key,
            label_value: label_value.to_string(),
        };
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Fan-out of [`PatientMerged`] events to in-process listeners.
///
/// Publishing never waits on a listener: with no subscribers the event is
/// dropped, and a subscriber that falls behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct MergeEventBus {
    tx: broadcast::Sender<PatientMerged>,
}

impl MergeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PatientMerged> {
        self.tx.subscribe()
    }

    /// Returns how many listeners received the event.
    pub fn publish(&self, event: PatientMerged) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::MergeStrategy;

    fn event() -> PatientMerged {
        PatientMerged {
            source_patient_id: Uuid::new_v4(),
            target_patient_id: Uuid::new_v4(),
            strategy: MergeStrategy::Manual,
            merged_by_user_id: Uuid::new_v4(),
            merge_log_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn counters_accumulate_per_label() {
        let reg = CounterRegistry::new();
        reg.incr(MERGE_TOTAL, "strategy", "phone_exact");
        reg.incr(MERGE_TOTAL, "strategy", "phone_exact");
        reg.incr(MERGE_TOTAL, "strategy", "manual");
        assert_eq!(reg.get(MERGE_TOTAL, "strategy", "phone_exact"), 2);
        assert_eq!(reg.get(MERGE_TOTAL, "strategy", "manual"), 1);
        assert_eq!(reg.get(MERGE_TOTAL, "strategy", "name_trgm"), 0);
    }

    #[test]
    fn renders_prometheus_text() {
        let reg = CounterRegistry::new();
        reg.incr(MERGE_FAILED_TOTAL, "reason", "SELF_MERGE");
        reg.incr(MERGE_TOTAL, "strategy", "email_exact");
        let text = reg.render_prometheus();
        assert_eq!(
            text,
            "# TYPE merge_failed_total counter\n\
             merge_failed_total{reason=\"SELF_MERGE\"} 1\n\
             # TYPE merge_total counter\n\
             merge_total{strategy=\"email_exact\"} 1\n"
        );
    }

    #[test]
    fn publish_without_listeners_is_not_an_error() {
        let bus = MergeEventBus::new(4);
        assert_eq!(bus.publish(event()), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = MergeEventBus::new(4);
        let mut rx = bus.subscribe();
        let e = event();
        assert_eq!(bus.publish(e.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), e);
    }

    #[test]
    fn slow_listener_never_blocks_publisher() {
        let bus = MergeEventBus::new(1);
        let _rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(event());
        }
    }
}
