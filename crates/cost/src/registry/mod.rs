//! Labeled gauge store.
//!
//! Each metric name maps to a family of series keyed by label set. A
//! [`MetricRegistry::reconcile`] builds the new series map off to the side
//! and swaps it in with a single write, so readers see either the previous
//! poll or the new one, never a mix. Families are independent: reconciling
//! one metric never waits on another.

mod exposition;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

pub use exposition::{render, CONTENT_TYPE};

/// Errors returned by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registry was closed during shutdown.
    #[error("Registry is closed")]
    Closed,

    /// Metric or label name is not a valid exposition identifier.
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

// ============================================================================
// Labels and measurements
// ============================================================================

/// Ordered label key/value pairs identifying one series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(Vec<(String, String)>);

impl LabelSet {
    /// Create an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, replacing any previous value for the same key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
        self
    }

    /// Look up a label value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for LabelSet {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs
            .into_iter()
            .fold(Self::new(), |labels, (k, v)| labels.with(k, v))
    }
}

/// One labeled reading produced by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Metric name.
    pub metric: String,
    /// Series labels.
    pub labels: LabelSet,
    /// Gauge value.
    pub value: f64,
}

impl Measurement {
    /// Create an unlabeled measurement.
    #[must_use]
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            labels: LabelSet::new(),
            value,
        }
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels = self.labels.with(key, value);
        self
    }
}

/// Static description of a metric family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Metric name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Label names, in exposition order.
    pub label_names: Vec<String>,
}

impl MetricDescriptor {
    /// Describe an unlabeled gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: Vec::new(),
        }
    }

    /// Declare the label names of a labeled gauge.
    #[must_use]
    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.label_names = labels.iter().map(|l| (*l).to_string()).collect();
        self
    }
}

/// Whether `name` is a valid metric or label identifier.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

// ============================================================================
// Registry
// ============================================================================

/// Series of one metric, keyed by label set.
pub type SeriesMap = BTreeMap<LabelSet, f64>;

#[derive(Debug)]
struct Family {
    descriptor: RwLock<MetricDescriptor>,
    series: RwLock<Arc<SeriesMap>>,
}

impl Family {
    fn new(descriptor: MetricDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            series: RwLock::new(Arc::new(SeriesMap::new())),
        }
    }

    fn descriptor(&self) -> MetricDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn series(&self) -> Arc<SeriesMap> {
        Arc::clone(&*self.series.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Result of a reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// Series present after the call.
    pub written: usize,
    /// Label sets that were present before and are now gone.
    pub evicted: usize,
}

/// Thread-safe labeled gauge registry.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    families: RwLock<BTreeMap<String, Arc<Family>>>,
    closed: AtomicBool,
}

impl MetricRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric family. Re-registering updates the descriptor and
    /// keeps the current series.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is closed or a name is invalid.
    pub fn register(&self, descriptor: MetricDescriptor) -> Result<(), RegistryError> {
        self.ensure_open()?;
        validate_descriptor(&descriptor)?;

        let mut families = self
            .families
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = families.get(&descriptor.name) {
            *family
                .descriptor
                .write()
                .unwrap_or_else(PoisonError::into_inner) = descriptor;
        } else {
            families.insert(descriptor.name.clone(), Arc::new(Family::new(descriptor)));
        }
        Ok(())
    }

    /// Replace every series of `metric` with exactly the label sets in
    /// `measurements`.
    ///
    /// Label sets that were published before and are absent now are removed.
    /// An empty slice clears the metric. Measurements for other metric names
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is closed or `metric` is not a
    /// valid name.
    pub fn reconcile(
        &self,
        metric: &str,
        measurements: &[Measurement],
    ) -> Result<ReconcileOutcome, RegistryError> {
        self.ensure_open()?;

        let mut fresh = SeriesMap::new();
        for m in measurements {
            if m.metric != metric {
                warn!(metric, other = %m.metric, "Ignoring measurement for a different metric");
                continue;
            }
            fresh.insert(m.labels.clone(), m.value);
        }

        let family = self.family_or_insert(metric)?;
        let fresh = Arc::new(fresh);
        let previous = {
            let mut slot = family.series.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, Arc::clone(&fresh))
        };

        let outcome = ReconcileOutcome {
            written: fresh.len(),
            evicted: previous.keys().filter(|k| !fresh.contains_key(*k)).count(),
        };
        debug!(
            metric,
            written = outcome.written,
            evicted = outcome.evicted,
            "Reconciled metric"
        );
        Ok(outcome)
    }

    /// Snapshot every family. Each family reflects one complete reconcile.
    #[must_use]
    pub fn read_all(&self) -> RegistrySnapshot {
        let families = self
            .families
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            families: families
                .values()
                .map(|family| FamilySnapshot {
                    descriptor: family.descriptor(),
                    series: family.series(),
                })
                .collect(),
        }
    }

    /// Current series of one metric.
    #[must_use]
    pub fn series(&self, metric: &str) -> Option<Arc<SeriesMap>> {
        self.families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(metric)
            .map(|family| family.series())
    }

    /// Mark the registry unavailable. Later reconciles are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    fn family_or_insert(&self, metric: &str) -> Result<Arc<Family>, RegistryError> {
        if let Some(family) = self
            .families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(metric)
        {
            return Ok(Arc::clone(family));
        }

        if !is_valid_name(metric) {
            return Err(RegistryError::InvalidName(metric.to_string()));
        }
        let mut families = self
            .families
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let family = families
            .entry(metric.to_string())
            .or_insert_with(|| Arc::new(Family::new(MetricDescriptor::new(metric, ""))));
        Ok(Arc::clone(family))
    }
}

fn validate_descriptor(descriptor: &MetricDescriptor) -> Result<(), RegistryError> {
    if !is_valid_name(&descriptor.name) {
        return Err(RegistryError::InvalidName(descriptor.name.clone()));
    }
    let mut seen = HashSet::new();
    for label in &descriptor.label_names {
        if !is_valid_name(label) || label.starts_with("__") || !seen.insert(label) {
            return Err(RegistryError::InvalidName(format!(
                "{}{{{label}}}",
                descriptor.name
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Snapshots
// ============================================================================

/// Point-in-time view of one family.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilySnapshot {
    pub descriptor: MetricDescriptor,
    pub series: Arc<SeriesMap>,
}

/// Point-in-time view of the whole registry, sorted by metric name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrySnapshot {
    pub families: Vec<FamilySnapshot>,
}

impl RegistrySnapshot {
    /// Find a family by name.
    #[must_use]
    pub fn family(&self, metric: &str) -> Option<&FamilySnapshot> {
        self.families.iter().find(|f| f.descriptor.name == metric)
    }

    /// Value of one series.
    #[must_use]
    pub fn value(&self, metric: &str, labels: &LabelSet) -> Option<f64> {
        self.family(metric)
            .and_then(|f| f.series.get(labels).copied())
    }

    /// Render in the text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        render(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, value: f64) -> Measurement {
        Measurement::new("aws_yesterday_costs_by_service", value).with_label("aws_service", name)
    }

    fn labels(name: &str) -> LabelSet {
        LabelSet::from([("aws_service", name)])
    }

    #[test]
    fn test_reconcile_clears_stale_labels() {
        let registry = MetricRegistry::new();
        let metric = "aws_yesterday_costs_by_service";

        registry
            .reconcile(metric, &[svc("A", 1.0), svc("B", 2.0)])
            .unwrap();
        let outcome = registry.reconcile(metric, &[svc("A", 3.0)]).unwrap();

        assert_eq!(outcome, ReconcileOutcome { written: 1, evicted: 1 });
        let series = registry.series(metric).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(&labels("A")), Some(&3.0));
        assert!(series.get(&labels("B")).is_none());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let registry = MetricRegistry::new();
        let metric = "aws_yesterday_costs_by_service";
        let batch = [svc("A", 1.0), svc("B", 2.0)];

        registry.reconcile(metric, &batch).unwrap();
        let first = registry.read_all();
        let outcome = registry.reconcile(metric, &batch).unwrap();
        let second = registry.read_all();

        assert_eq!(first, second);
        assert_eq!(outcome.evicted, 0);
    }

    #[test]
    fn test_empty_reconcile_clears_series() {
        let registry = MetricRegistry::new();
        let metric = "gcp_yesterday_costs_by_service";
        let m = Measurement::new(metric, 4.0).with_label("gcp_service", "X");

        registry.reconcile(metric, &[m]).unwrap();
        registry.reconcile(metric, &[]).unwrap();

        assert!(registry.series(metric).unwrap().is_empty());
        // The family itself stays registered.
        assert!(registry.read_all().family(metric).is_some());
    }

    #[test]
    fn test_reconcile_leaves_other_metrics_alone() {
        let registry = MetricRegistry::new();
        registry
            .reconcile("aws_today_daily_costs", &[Measurement::new("aws_today_daily_costs", 7.0)])
            .unwrap();
        registry
            .reconcile("aws_yesterday_costs_by_service", &[])
            .unwrap();

        let snapshot = registry.read_all();
        assert_eq!(
            snapshot.value("aws_today_daily_costs", &LabelSet::new()),
            Some(7.0)
        );
    }

    #[test]
    fn test_reconcile_ignores_foreign_measurements() {
        let registry = MetricRegistry::new();
        let outcome = registry
            .reconcile(
                "aws_today_daily_costs",
                &[
                    Measurement::new("aws_today_daily_costs", 1.0),
                    Measurement::new("aws_month_to_date_costs", 2.0),
                ],
            )
            .unwrap();
        assert_eq!(outcome.written, 1);
        assert!(registry.series("aws_month_to_date_costs").is_none());
    }

    #[test]
    fn test_duplicate_labels_last_wins() {
        let registry = MetricRegistry::new();
        let metric = "aws_yesterday_costs_by_service";
        registry
            .reconcile(metric, &[svc("A", 1.0), svc("A", 2.0)])
            .unwrap();
        assert_eq!(registry.series(metric).unwrap().get(&labels("A")), Some(&2.0));
    }

    #[test]
    fn test_closed_registry_rejects_reconcile() {
        let registry = MetricRegistry::new();
        registry
            .reconcile("aws_today_daily_costs", &[Measurement::new("aws_today_daily_costs", 1.0)])
            .unwrap();
        registry.close();

        let err = registry
            .reconcile("aws_today_daily_costs", &[])
            .unwrap_err();
        assert_eq!(err, RegistryError::Closed);
        // Nothing was cleared.
        assert_eq!(registry.series("aws_today_daily_costs").unwrap().len(), 1);
    }

    #[test]
    fn test_register_validates_names() {
        let registry = MetricRegistry::new();
        assert!(registry
            .register(MetricDescriptor::new("9lives", "bad"))
            .is_err());
        assert!(registry
            .register(MetricDescriptor::new("ok_metric", "fine").with_labels(&["a", "a"]))
            .is_err());
        assert!(registry
            .register(MetricDescriptor::new("ok_metric", "fine").with_labels(&["__reserved"]))
            .is_err());
        assert!(registry
            .register(MetricDescriptor::new("ok_metric", "fine").with_labels(&["month_year"]))
            .is_ok());
        assert!(registry.reconcile("bad-name", &[]).is_err());
    }

    #[test]
    fn test_register_keeps_series() {
        let registry = MetricRegistry::new();
        let metric = "aws_today_daily_costs";
        registry.register(MetricDescriptor::new(metric, "old")).unwrap();
        registry
            .reconcile(metric, &[Measurement::new(metric, 1.0)])
            .unwrap();
        registry.register(MetricDescriptor::new(metric, "new")).unwrap();

        let snapshot = registry.read_all();
        let family = snapshot.family(metric).unwrap();
        assert_eq!(family.descriptor.help, "new");
        assert_eq!(family.series.len(), 1);
    }

    #[test]
    fn test_label_set_with_replaces() {
        let labels = LabelSet::new().with("a", "1").with("b", "2").with("a", "3");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("a"), Some("3"));
        assert_eq!(labels.iter().next(), Some(("a", "3")));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_series() {
        let registry = Arc::new(MetricRegistry::new());
        let metric = "serverscom_monthly_expenses";
        let batch = move |offset: f64| -> Vec<Measurement> {
            (0..50)
                .map(|i| {
                    Measurement::new(metric, offset)
                        .with_label("month_year", format!("2024-{i:02}"))
                })
                .collect()
        };
        registry.reconcile(metric, &batch(0.0)).unwrap();

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for round in 1..200 {
                    registry.reconcile(metric, &batch(f64::from(round))).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let series = registry.series(metric).unwrap();
            assert_eq!(series.len(), 50);
            let first = series.values().next().copied().unwrap();
            assert!(series.values().all(|v| (*v - first).abs() < f64::EPSILON));
        }
        writer.join().unwrap();
    }
}
