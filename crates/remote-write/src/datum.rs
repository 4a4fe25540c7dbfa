use labels::LabelSet;

/// A single routed data point: one observation of one time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    /// Identifying labels of the series: sorted, unique names.
    /// This is the routing key for shard assignment.
    pub series: LabelSet,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub value: Payload,
}

/// The observation carried by a [`Datum`]. Exactly one payload per point,
/// by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Sample { value: f64 },
    Exemplar { labels: LabelSet, value: f64 },
    Histogram(Histogram),
    FloatHistogram(FloatHistogram),
}

/// The accounting bucket of a payload. Integer and float histograms share
/// one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Sample,
    Exemplar,
    Histogram,
}

impl Payload {
    pub fn kind(&self) -> PointKind {
        match self {
            Payload::Sample { .. } => PointKind::Sample,
            Payload::Exemplar { .. } => PointKind::Exemplar,
            Payload::Histogram(_) | Payload::FloatHistogram(_) => PointKind::Histogram,
        }
    }
}

impl Datum {
    pub fn sample(series: LabelSet, timestamp_ms: i64, value: f64) -> Self {
        Self {
            series,
            timestamp_ms,
            value: Payload::Sample { value },
        }
    }

    pub fn exemplar(series: LabelSet, timestamp_ms: i64, value: f64, labels: LabelSet) -> Self {
        Self {
            series,
            timestamp_ms,
            value: Payload::Exemplar { labels, value },
        }
    }

    pub fn histogram(series: LabelSet, timestamp_ms: i64, histogram: Histogram) -> Self {
        Self {
            series,
            timestamp_ms,
            value: Payload::Histogram(histogram),
        }
    }

    pub fn float_histogram(series: LabelSet, timestamp_ms: i64, histogram: FloatHistogram) -> Self {
        Self {
            series,
            timestamp_ms,
            value: Payload::FloatHistogram(histogram),
        }
    }
}

/// A span of contiguous buckets in a sparse histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpan {
    /// Gap to the previous span, in buckets.
    pub offset: i32,
    pub length: u32,
}

/// A sparse-bucketed histogram observation with integer bucket counts,
/// delta-encoded within each span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    /// Resolution: bucket boundaries grow by powers of 2^(2^-schema).
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub negative_spans: Vec<BucketSpan>,
    pub negative_deltas: Vec<i64>,
    pub positive_spans: Vec<BucketSpan>,
    pub positive_deltas: Vec<i64>,
}

/// The float-count variant of [`Histogram`]: bucket counts are absolute
/// floating-point values rather than integer deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloatHistogram {
    pub count: f64,
    pub sum: f64,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub negative_spans: Vec<BucketSpan>,
    pub negative_counts: Vec<f64>,
    pub positive_spans: Vec<BucketSpan>,
    pub positive_counts: Vec<f64>,
}

/// Per-metric-family metadata, shipped out-of-band from samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMetadata {
    pub family_name: String,
    pub kind: MetadataKind,
    pub help: String,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Counter,
    Gauge,
    Histogram,
    GaugeHistogram,
    Summary,
    Info,
    StateSet,
    Unknown,
}

/// Per-kind point counts, used for pending/failed/retried accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub samples: usize,
    pub exemplars: usize,
    pub histograms: usize,
}

impl KindCounts {
    pub fn total(&self) -> usize {
        self.samples + self.exemplars + self.histograms
    }

    pub fn bump(&mut self, kind: PointKind) {
        match kind {
            PointKind::Sample => self.samples += 1,
            PointKind::Exemplar => self.exemplars += 1,
            PointKind::Histogram => self.histograms += 1,
        }
    }
}

/// One series of a wire request: the shape consumed by the request encoder.
/// Entries are reused across sends, so constituent vectors hold at most one
/// point but keep their allocations.
#[derive(Debug, Clone, Default)]
pub struct TimeSeriesEntry {
    pub labels: LabelSet,
    pub samples: Vec<SamplePoint>,
    pub exemplars: Vec<ExemplarPoint>,
    pub histograms: Vec<HistogramPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    pub value: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExemplarPoint {
    pub labels: LabelSet,
    pub value: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramPoint {
    pub timestamp_ms: i64,
    pub histogram: HistogramValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistogramValue {
    Integer(Histogram),
    Float(FloatHistogram),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kinds() {
        let series = labels::build_set([("app", "api")]).unwrap();
        assert_eq!(
            Datum::sample(series.clone(), 1, 1.0).value.kind(),
            PointKind::Sample
        );
        assert_eq!(
            Datum::exemplar(series.clone(), 1, 1.0, LabelSet::default())
                .value
                .kind(),
            PointKind::Exemplar
        );
        assert_eq!(
            Datum::histogram(series.clone(), 1, Histogram::default())
                .value
                .kind(),
            PointKind::Histogram
        );
        assert_eq!(
            Datum::float_histogram(series, 1, FloatHistogram::default())
                .value
                .kind(),
            PointKind::Histogram
        );
    }

    #[test]
    fn test_kind_counts() {
        let mut counts = KindCounts::default();
        counts.bump(PointKind::Sample);
        counts.bump(PointKind::Sample);
        counts.bump(PointKind::Exemplar);
        counts.bump(PointKind::Histogram);
        assert_eq!(
            counts,
            KindCounts {
                samples: 2,
                exemplars: 1,
                histograms: 1
            }
        );
        assert_eq!(counts.total(), 4);
    }
}
