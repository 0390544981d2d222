//! Metric instruments, aggregation and temporality.
//!
//! Every instrument keeps one accumulator per distinct [`AttributeSet`]
//! behind a per-instrument lock, so concurrent updates to the same series
//! never lose increments. [`MeterProvider::collect`] snapshots all
//! instruments, resetting DELTA accumulators and leaving CUMULATIVE ones
//! running.

use crate::attributes::{AttributeSet, KeyValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;

/// Default explicit bucket boundaries for histograms.
pub const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Instrument kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Monotonic, synchronous sum.
    Counter,
    /// Non-monotonic, synchronous sum.
    UpDownCounter,
    /// Distribution of recorded values.
    Histogram,
    /// Monotonic sum observed through a callback.
    ObservableCounter,
    /// Non-monotonic sum observed through a callback.
    ObservableUpDownCounter,
}

impl InstrumentKind {
    /// Returns the temporality this kind is exported with unless overridden.
    pub fn preferred_temporality(self) -> Temporality {
        match self {
            InstrumentKind::Counter
            | InstrumentKind::Histogram
            | InstrumentKind::ObservableCounter => Temporality::Delta,
            InstrumentKind::UpDownCounter | InstrumentKind::ObservableUpDownCounter => {
                Temporality::Cumulative
            }
        }
    }

    fn is_monotonic(self) -> bool {
        matches!(
            self,
            InstrumentKind::Counter | InstrumentKind::ObservableCounter
        )
    }
}

/// Aggregation temporality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    /// Change since the previous collection; accumulators reset each cycle.
    Delta,
    /// Running total since the provider started.
    Cumulative,
}

/// Maps instrument kinds to temporalities.
#[derive(Debug, Clone, Default)]
pub struct TemporalitySelector {
    overrides: HashMap<InstrumentKind, Temporality>,
}

impl TemporalitySelector {
    /// Creates a selector that applies `overrides` on top of each kind's
    /// preferred temporality.
    pub fn new(overrides: HashMap<InstrumentKind, Temporality>) -> Self {
        Self { overrides }
    }

    /// Returns the temporality used for `kind`.
    pub fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.preferred_temporality())
    }
}

/// One collected metric stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    /// Instrumentation scope of the meter that created the instrument.
    pub scope: Arc<str>,
    /// Instrument name.
    pub name: String,
    /// Instrument description.
    pub description: String,
    /// Instrument kind.
    pub kind: InstrumentKind,
    /// Temporality the points are expressed in.
    pub temporality: Temporality,
    /// Start of the reporting window.
    pub start_time: SystemTime,
    /// Collection time.
    pub time: SystemTime,
    /// Data points.
    pub points: MetricPoints,
}

/// Data points of one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPoints {
    /// Counter-like sums.
    Sum {
        /// Whether the sum only ever increases.
        monotonic: bool,
        /// One point per attribute set.
        points: Vec<SumPoint>,
    },
    /// Histogram distributions, one per attribute set.
    Histogram(Vec<HistogramPoint>),
}

impl MetricPoints {
    /// Returns the number of points.
    pub fn len(&self) -> usize {
        match self {
            MetricPoints::Sum { points, .. } => points.len(),
            MetricPoints::Histogram(points) => points.len(),
        }
    }

    /// Returns whether there are no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sum for one attribute set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumPoint {
    /// Series attributes.
    pub attributes: AttributeSet,
    /// Aggregated value.
    pub value: i64,
}

/// A histogram for one attribute set.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramPoint {
    /// Series attributes.
    pub attributes: AttributeSet,
    /// Number of recorded values.
    pub count: u64,
    /// Sum of recorded values.
    pub sum: f64,
    /// Smallest recorded value.
    pub min: f64,
    /// Largest recorded value.
    pub max: f64,
    /// Upper bucket boundaries (inclusive).
    pub bounds: Arc<[f64]>,
    /// Per-bucket counts; one more entry than `bounds`.
    pub bucket_counts: Vec<u64>,
}

#[derive(Debug, Clone)]
struct HistogramAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    bucket_counts: Vec<u64>,
}

impl HistogramAccumulator {
    fn new(buckets: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            bucket_counts: vec![0; buckets],
        }
    }

    fn record(&mut self, bounds: &[f64], value: f64) {
        let idx = bounds.partition_point(|bound| *bound < value);
        self.bucket_counts[idx] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

type ObserveFn = Box<dyn Fn() -> HashMap<AttributeSet, i64> + Send + Sync>;

enum Storage {
    Sum(Mutex<HashMap<AttributeSet, i64>>),
    Histogram {
        bounds: Arc<[f64]>,
        values: Mutex<HashMap<AttributeSet, HistogramAccumulator>>,
    },
    Observable {
        callback: ObserveFn,
        last: Mutex<HashMap<AttributeSet, i64>>,
    },
}

struct Instrument {
    scope: Arc<str>,
    name: String,
    description: String,
    kind: InstrumentKind,
    storage: Storage,
}

impl Instrument {
    fn add(&self, value: i64, attributes: &[KeyValue]) {
        if let Storage::Sum(values) = &self.storage {
            let key = AttributeSet::from(attributes);
            let mut values = values.lock();
            let total = values.entry(key).or_insert(0);
            *total = total.saturating_add(value);
        }
    }

    fn record(&self, value: f64, attributes: &[KeyValue]) {
        if value.is_nan() {
            return;
        }
        if let Storage::Histogram { bounds, values } = &self.storage {
            let key = AttributeSet::from(attributes);
            values
                .lock()
                .entry(key)
                .or_insert_with(|| HistogramAccumulator::new(bounds.len() + 1))
                .record(bounds, value);
        }
    }

    fn collect(&self, temporality: Temporality) -> MetricPoints {
        let monotonic = self.kind.is_monotonic();
        match &self.storage {
            Storage::Sum(values) => {
                let snapshot = match temporality {
                    Temporality::Delta => std::mem::take(&mut *values.lock()),
                    Temporality::Cumulative => values.lock().clone(),
                };
                MetricPoints::Sum {
                    monotonic,
                    points: sum_points(snapshot),
                }
            }
            Storage::Histogram { bounds, values } => {
                let snapshot = match temporality {
                    Temporality::Delta => std::mem::take(&mut *values.lock()),
                    Temporality::Cumulative => values.lock().clone(),
                };
                let mut points: Vec<HistogramPoint> = snapshot
                    .into_iter()
                    .map(|(attributes, acc)| HistogramPoint {
                        attributes,
                        count: acc.count,
                        sum: acc.sum,
                        min: acc.min,
                        max: acc.max,
                        bounds: Arc::clone(bounds),
                        bucket_counts: acc.bucket_counts,
                    })
                    .collect();
                points.sort_by(|a, b| attribute_order(&a.attributes, &b.attributes));
                MetricPoints::Histogram(points)
            }
            Storage::Observable { callback, last } => {
                let current = callback();
                let snapshot = match temporality {
                    Temporality::Cumulative => {
                        *last.lock() = current.clone();
                        current
                    }
                    Temporality::Delta => {
                        let mut last = last.lock();
                        let deltas = current
                            .iter()
                            .map(|(attributes, value)| {
                                let previous = last.get(attributes).copied().unwrap_or(0);
                                // A total lower than last time means the source reset.
                                let delta = if *value < previous {
                                    *value
                                } else {
                                    value - previous
                                };
                                (attributes.clone(), delta)
                            })
                            .collect();
                        *last = current;
                        deltas
                    }
                };
                MetricPoints::Sum {
                    monotonic,
                    points: sum_points(snapshot),
                }
            }
        }
    }
}

fn sum_points(values: HashMap<AttributeSet, i64>) -> Vec<SumPoint> {
    let mut points: Vec<SumPoint> = values
        .into_iter()
        .map(|(attributes, value)| SumPoint { attributes, value })
        .collect();
    points.sort_by(|a, b| attribute_order(&a.attributes, &b.attributes));
    points
}

fn attribute_order(a: &AttributeSet, b: &AttributeSet) -> std::cmp::Ordering {
    let key = |set: &AttributeSet| {
        set.iter()
            .map(|kv| format!("{}={}", kv.key, kv.value))
            .collect::<Vec<_>>()
    };
    key(a).cmp(&key(b))
}

struct ProviderInner {
    selector: TemporalitySelector,
    start_time: SystemTime,
    last_collect: Mutex<SystemTime>,
    instruments: Mutex<Vec<Arc<Instrument>>>,
}

/// Owns every instrument and produces metric snapshots.
///
/// Cloning is cheap; clones share the same instruments.
#[derive(Clone)]
pub struct MeterProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for MeterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterProvider")
            .field("selector", &self.inner.selector)
            .field("instruments", &self.inner.instruments.lock().len())
            .finish()
    }
}

impl Default for MeterProvider {
    fn default() -> Self {
        Self::new(TemporalitySelector::default())
    }
}

impl MeterProvider {
    /// Creates a provider using `selector` to pick each kind's temporality.
    pub fn new(selector: TemporalitySelector) -> Self {
        let now = SystemTime::now();
        Self {
            inner: Arc::new(ProviderInner {
                selector,
                start_time: now,
                last_collect: Mutex::new(now),
                instruments: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a meter for the given instrumentation scope.
    pub fn meter(&self, scope: impl Into<Cow<'static, str>>) -> Meter {
        let scope: Cow<'static, str> = scope.into();
        Meter {
            provider: self.clone(),
            scope: Arc::from(scope.as_ref()),
        }
    }

    /// Returns the temporality used for `kind`.
    pub fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.selector.temporality(kind)
    }

    /// Returns when the provider was created.
    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    /// Snapshots every instrument.
    ///
    /// DELTA accumulators are reset; streams with no points are omitted.
    pub fn collect(&self) -> Vec<MetricData> {
        let instruments = self.inner.instruments.lock().clone();
        let now = SystemTime::now();
        let previous = std::mem::replace(&mut *self.inner.last_collect.lock(), now);

        instruments
            .iter()
            .filter_map(|instrument| {
                let temporality = self.temporality(instrument.kind);
                let points = instrument.collect(temporality);
                if points.is_empty() {
                    return None;
                }
                let start_time = match temporality {
                    Temporality::Delta => previous,
                    Temporality::Cumulative => self.inner.start_time,
                };
                Some(MetricData {
                    scope: Arc::clone(&instrument.scope),
                    name: instrument.name.clone(),
                    description: instrument.description.clone(),
                    kind: instrument.kind,
                    temporality,
                    start_time,
                    time: now,
                    points,
                })
            })
            .collect()
    }

    fn register(
        &self,
        scope: &Arc<str>,
        name: String,
        description: String,
        kind: InstrumentKind,
        storage: impl FnOnce() -> Storage,
    ) -> Arc<Instrument> {
        let mut instruments = self.inner.instruments.lock();

        let reusable = !matches!(
            kind,
            InstrumentKind::ObservableCounter | InstrumentKind::ObservableUpDownCounter
        );
        let existing = instruments
            .iter()
            .find(|i| i.scope == *scope && i.name.eq_ignore_ascii_case(&name));

        let instrument = Arc::new(Instrument {
            scope: Arc::clone(scope),
            name,
            description,
            kind,
            storage: storage(),
        });

        match existing {
            Some(existing) if reusable && existing.kind == kind => Arc::clone(existing),
            Some(existing) => {
                tracing::warn!(
                    scope = %scope,
                    name = %instrument.name,
                    existing_kind = ?existing.kind,
                    requested_kind = ?kind,
                    "Instrument name already registered, measurements will be discarded"
                );
                instrument
            }
            None => {
                instruments.push(Arc::clone(&instrument));
                instrument
            }
        }
    }
}

/// Creates instruments for one instrumentation scope.
#[derive(Clone, Debug)]
pub struct Meter {
    provider: MeterProvider,
    scope: Arc<str>,
}

impl Meter {
    /// Returns the instrumentation scope name.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Creates a monotonic counter.
    ///
    /// Creating a counter with a name already registered in this scope
    /// returns a handle to the existing one. If the name belongs to an
    /// instrument of another kind, or to an observable instrument, the new
    /// handle is never collected. Names compare case-insensitively.
    pub fn create_counter(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Counter {
        Counter {
            instrument: self.provider.register(
                &self.scope,
                name.into(),
                description.into(),
                InstrumentKind::Counter,
                || Storage::Sum(Mutex::default()),
            ),
        }
    }

    /// Creates a non-monotonic counter.
    pub fn create_up_down_counter(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> UpDownCounter {
        UpDownCounter {
            instrument: self.provider.register(
                &self.scope,
                name.into(),
                description.into(),
                InstrumentKind::UpDownCounter,
                || Storage::Sum(Mutex::default()),
            ),
        }
    }

    /// Creates a histogram with [`DEFAULT_HISTOGRAM_BOUNDARIES`].
    pub fn create_histogram(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Histogram {
        self.create_histogram_with_boundaries(name, description, &DEFAULT_HISTOGRAM_BOUNDARIES)
    }

    /// Creates a histogram with explicit bucket boundaries.
    ///
    /// Boundaries are sorted and deduplicated; NaN boundaries are discarded.
    pub fn create_histogram_with_boundaries(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        boundaries: &[f64],
    ) -> Histogram {
        let mut bounds: Vec<f64> = boundaries.iter().copied().filter(|b| !b.is_nan()).collect();
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let bounds: Arc<[f64]> = bounds.into();

        Histogram {
            instrument: self.provider.register(
                &self.scope,
                name.into(),
                description.into(),
                InstrumentKind::Histogram,
                || Storage::Histogram {
                    bounds,
                    values: Mutex::default(),
                },
            ),
        }
    }

    /// Registers a monotonic counter whose running totals are reported by
    /// `callback` at each collection.
    pub fn create_observable_counter<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        callback: F,
    ) -> ObservableCounter
    where
        F: Fn(&mut Observer<u64>) + Send + Sync + 'static,
    {
        let observe: ObserveFn = Box::new(move || {
            let mut observer = Observer::new();
            callback(&mut observer);
            observer.values
        });
        ObservableCounter {
            _instrument: self.provider.register(
                &self.scope,
                name.into(),
                description.into(),
                InstrumentKind::ObservableCounter,
                || Storage::Observable {
                    callback: observe,
                    last: Mutex::default(),
                },
            ),
        }
    }

    /// Registers a non-monotonic counter whose running totals are reported
    /// by `callback` at each collection.
    pub fn create_observable_up_down_counter<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        callback: F,
    ) -> ObservableUpDownCounter
    where
        F: Fn(&mut Observer<i64>) + Send + Sync + 'static,
    {
        let observe: ObserveFn = Box::new(move || {
            let mut observer = Observer::new();
            callback(&mut observer);
            observer.values
        });
        ObservableUpDownCounter {
            _instrument: self.provider.register(
                &self.scope,
                name.into(),
                description.into(),
                InstrumentKind::ObservableUpDownCounter,
                || Storage::Observable {
                    callback: observe,
                    last: Mutex::default(),
                },
            ),
        }
    }
}

/// Monotonic counter.
#[derive(Clone)]
pub struct Counter {
    instrument: Arc<Instrument>,
}

impl Counter {
    /// Adds `value` to the series identified by `attributes`.
    pub fn add(&self, value: u64, attributes: &[KeyValue]) {
        self.instrument
            .add(i64::try_from(value).unwrap_or(i64::MAX), attributes);
    }
}

/// Non-monotonic counter.
#[derive(Clone)]
pub struct UpDownCounter {
    instrument: Arc<Instrument>,
}

impl UpDownCounter {
    /// Adds `value` (possibly negative) to the series identified by
    /// `attributes`.
    pub fn add(&self, value: i64, attributes: &[KeyValue]) {
        self.instrument.add(value, attributes);
    }
}

/// Histogram of `f64` values.
#[derive(Clone)]
pub struct Histogram {
    instrument: Arc<Instrument>,
}

impl Histogram {
    /// Records `value`. NaN is ignored.
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        self.instrument.record(value, attributes);
    }
}

/// Handle to a registered observable counter.
///
/// The callback stays registered for the provider's lifetime.
#[derive(Clone)]
pub struct ObservableCounter {
    _instrument: Arc<Instrument>,
}

/// Handle to a registered observable up-down counter.
#[derive(Clone)]
pub struct ObservableUpDownCounter {
    _instrument: Arc<Instrument>,
}

macro_rules! impl_instrument_debug {
    ($($ty:ident),*) => {
        $(impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty)).finish_non_exhaustive()
            }
        })*
    };
}

impl_instrument_debug!(
    Counter,
    UpDownCounter,
    Histogram,
    ObservableCounter,
    ObservableUpDownCounter
);

/// Receives the running totals reported by an observable callback.
///
/// Observing the same attribute set twice keeps the last value.
#[derive(Debug)]
pub struct Observer<T> {
    values: HashMap<AttributeSet, i64>,
    _marker: PhantomData<T>,
}

impl<T> Observer<T> {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            _marker: PhantomData,
        }
    }
}

impl Observer<u64> {
    /// Reports the running total for `attributes`.
    pub fn observe(&mut self, value: u64, attributes: &[KeyValue]) {
        self.values.insert(
            AttributeSet::from(attributes),
            i64::try_from(value).unwrap_or(i64::MAX),
        );
    }
}

impl Observer<i64> {
    /// Reports the running total for `attributes`.
    pub fn observe(&mut self, value: i64, attributes: &[KeyValue]) {
        self.values.insert(AttributeSet::from(attributes), value);
    }
}
