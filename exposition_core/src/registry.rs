use indexmap::IndexMap; // hash table w/ fast iter preserving insertion order
use parking_lot::RwLock; // faster lock for read-mostly access
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::MetricsError;
use crate::{MetricKind, SampleValue};

/// The immutable identity of a metric: its name, kind, help text and the
/// label names its series are keyed by.
///
/// Names are validated eagerly, so a registered descriptor can always be
/// rendered in the exposition format.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricDescriptor {
    name: String,
    kind: MetricKind,
    help: String,
    labels: Vec<String>,
}

impl MetricDescriptor {
    pub fn new(
        name: &str,
        kind: MetricKind,
        help: &str,
        labels: &[&str],
    ) -> Result<Self, MetricsError> {
        if !is_valid_metric_name(name) {
            return Err(MetricsError::InvalidName(name.to_string()));
        }
        for (index, label) in labels.iter().enumerate() {
            if !is_valid_label_name(label) || labels[..index].contains(label) {
                return Err(MetricsError::InvalidName(label.to_string()));
            }
        }
        Ok(MetricDescriptor {
            name: name.to_string(),
            kind,
            help: help.to_string(),
            labels: labels.iter().map(|label| label.to_string()).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Metric names: `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == ':' => (),
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}

/// Label names: `[a-zA-Z_][a-zA-Z0-9_]*`; the `__` prefix is reserved
fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => (),
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// One labeled series: a single 64-bit value cell updated in place.
///
/// The cell stores f64 bits so integer and float updates share one lock-free
/// path; `Registry::snapshot` classifies the value on the way out.
#[derive(Debug)]
pub struct Series {
    descriptor: Arc<MetricDescriptor>,
    bits: AtomicU64,
}

impl Series {
    fn new(descriptor: Arc<MetricDescriptor>) -> Self {
        Series {
            descriptor,
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Add a non-negative delta to a counter.
    ///
    /// Counters are monotonically non-decreasing; the only reset is a
    /// process restart. NaN deltas are rejected along with negative ones.
    pub fn inc(&self, delta: f64) -> Result<(), MetricsError> {
        if self.descriptor.kind() != MetricKind::Counter {
            return Err(self.invalid_op("inc"));
        }
        if delta.is_nan() || delta < 0.0 {
            return Err(self.invalid_op("inc by a negative delta"));
        }
        let mut prev = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(prev) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(seen) => prev = seen,
            }
        }
        Ok(())
    }

    /// Replace a gauge's value.
    pub fn set(&self, value: f64) -> Result<(), MetricsError> {
        if self.descriptor.kind() != MetricKind::Gauge {
            return Err(self.invalid_op("set"));
        }
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn invalid_op(&self, op: &'static str) -> MetricsError {
        MetricsError::InvalidOperation {
            name: self.descriptor.name().to_string(),
            kind: self.descriptor.kind().as_str(),
            op,
        }
    }
}

/// A registered metric and the labeled series created under it.
#[derive(Debug)]
pub struct Metric {
    descriptor: Arc<MetricDescriptor>,

    /// Series keyed by their label values in declared order.
    ///
    /// Insertion order is preserved so snapshots stay byte-stable between
    /// scrapes while values are unchanged.
    series: RwLock<IndexMap<Vec<String>, Arc<Series>>>,
}

impl Metric {
    fn new(descriptor: MetricDescriptor) -> Self {
        Metric {
            descriptor: Arc::new(descriptor),
            series: RwLock::new(IndexMap::new()),
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Get (or create) the series for a label-value set.
    ///
    /// `labels` may be given in any order, but must name each declared
    /// label exactly once. The same value tuple always returns the same
    /// series handle.
    pub fn with_labels(&self, labels: &[(&str, &str)]) -> Result<Arc<Series>, MetricsError> {
        let values = self.canonical_values(labels)?;

        // Fast path: the series already exists
        if let Some(series) = self.series.read().get(&values) {
            return Ok(Arc::clone(series));
        }

        // Re-check under the write lock in case another writer created it first
        let mut series = self.series.write();
        let series = series
            .entry(values)
            .or_insert_with(|| Arc::new(Series::new(Arc::clone(&self.descriptor))));
        Ok(Arc::clone(series))
    }

    /// Shorthand for metrics declared without labels.
    pub fn series(&self) -> Result<Arc<Series>, MetricsError> {
        self.with_labels(&[])
    }

    /// Order the supplied values by the declared label order, verifying the
    /// supplied names are exactly the declared set.
    fn canonical_values(&self, labels: &[(&str, &str)]) -> Result<Vec<String>, MetricsError> {
        let declared = self.descriptor.labels();
        if labels.len() != declared.len() {
            return Err(MetricsError::LabelCardinality(
                self.descriptor.name().to_string(),
            ));
        }
        let mut values = Vec::with_capacity(declared.len());
        for name in declared {
            let mut matches = labels.iter().filter(|(label, _)| *label == name.as_str());
            match (matches.next(), matches.next()) {
                (Some((_, value)), None) => values.push(value.to_string()),
                // Missing, or supplied more than once
                _ => {
                    return Err(MetricsError::LabelCardinality(
                        self.descriptor.name().to_string(),
                    ))
                }
            }
        }
        Ok(values)
    }
}

/// A point-in-time copy of one metric's series.
pub struct MetricSnapshot {
    pub descriptor: Arc<MetricDescriptor>,
    pub samples: Vec<SampleRow>,
}

/// One series' labels (static labels first, then declared labels in order)
/// and its value at snapshot time.
pub struct SampleRow {
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

/// The single source of truth for all metrics in a process.
///
/// Purely in-memory; values reset when the process restarts. Construct one
/// instance at startup and share it by reference; tests build a fresh
/// registry per case.
pub struct Registry {
    /// Metrics in registration order, for deterministic exposition output.
    metrics: RwLock<IndexMap<String, Arc<Metric>>>,

    /// A static set of labels to append to every exposed series
    static_labels: Vec<(String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::with_static_labels(Vec::new())
    }

    /// A registry whose exposed series all carry the given static labels
    /// (deployment metadata such as `environment=production`).
    pub fn with_static_labels(labels: Vec<(String, String)>) -> Self {
        Registry {
            metrics: RwLock::new(IndexMap::new()),
            static_labels: labels,
        }
    }

    pub fn static_labels(&self) -> &[(String, String)] {
        &self.static_labels
    }

    /// Register a metric, or return the existing handle when `descriptor`
    /// matches a previous registration exactly.
    ///
    /// Concurrent conflicting registrations fail deterministically: the
    /// first writer wins and later callers see `DuplicateName`.
    pub fn get_or_create(
        &self,
        descriptor: MetricDescriptor,
    ) -> Result<Arc<Metric>, MetricsError> {
        // Fast path: already registered
        if let Some(metric) = self.metrics.read().get(descriptor.name()) {
            return Registry::existing(metric, &descriptor);
        }

        let mut metrics = self.metrics.write();
        if let Some(metric) = metrics.get(descriptor.name()) {
            return Registry::existing(metric, &descriptor);
        }
        let name = descriptor.name().to_string();
        let metric = Arc::new(Metric::new(descriptor));
        metrics.insert(name, Arc::clone(&metric));
        Ok(metric)
    }

    fn existing(
        metric: &Arc<Metric>,
        descriptor: &MetricDescriptor,
    ) -> Result<Arc<Metric>, MetricsError> {
        if metric.descriptor() == descriptor {
            Ok(Arc::clone(metric))
        } else {
            Err(MetricsError::DuplicateName(descriptor.name().to_string()))
        }
    }

    /// Copy the current values of every series.
    ///
    /// The registry lock is held only long enough to clone the metric list,
    /// and each metric's series lock only while its values are read, so
    /// writers on unrelated series are never stalled for a whole encode.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let metrics = {
            let metrics = self.metrics.read();
            metrics.values().cloned().collect::<Vec<_>>()
        };

        let mut snapshots = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let descriptor = Arc::clone(&metric.descriptor);
            let series = metric.series.read();
            let mut samples = Vec::with_capacity(series.len());
            for (values, cell) in series.iter() {
                let labels = self
                    .static_labels
                    .iter()
                    .cloned()
                    .chain(
                        descriptor
                            .labels()
                            .iter()
                            .cloned()
                            .zip(values.iter().cloned()),
                    )
                    .collect();
                samples.push(SampleRow {
                    labels,
                    value: SampleValue::from_f64(cell.value()),
                });
            }
            snapshots.push(MetricSnapshot {
                descriptor,
                samples,
            });
        }
        snapshots
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
