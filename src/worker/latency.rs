//! Latency histogram using HdrHistogram
//!
//! Samples are recorded in nanoseconds between 1ns and one hour with three
//! significant digits. The histogram is allocated on the first sample, so an
//! operation type a worker never issues costs nothing.

use hdrhistogram::Histogram;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::time::Duration;
use tracing::warn;

const LOWEST_NS: u64 = 1;
const HIGHEST_NS: u64 = 3_600_000_000_000;
const SIGFIG: u8 = 3;

#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    histogram: Option<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn histogram_mut(&mut self) -> Option<&mut Histogram<u64>> {
        if self.histogram.is_none() {
            match Histogram::new_with_bounds(LOWEST_NS, HIGHEST_NS, SIGFIG) {
                Ok(h) => self.histogram = Some(h),
                Err(e) => warn!(err = ?e, "cannot allocate latency histogram"),
            }
        }
        self.histogram.as_mut()
    }

    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let nanos = (latency.as_nanos() as u64).clamp(LOWEST_NS, HIGHEST_NS);
        if let Some(h) = self.histogram_mut() {
            h.saturating_record(nanos);
        }
    }

    /// Fold another histogram's samples into this one
    pub fn merge(&mut self, other: &LatencyHistogram) {
        let Some(src) = &other.histogram else {
            return;
        };
        if let Some(h) = self.histogram_mut() {
            if let Err(e) = h.add(src) {
                warn!(err = ?e, "cannot merge latency histograms");
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.histogram.as_ref().map_or(0, |h| h.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `percentile` (0-100), or `None` when empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        self.nonempty().map(|h| Duration::from_nanos(h.value_at_percentile(percentile)))
    }

    pub fn min(&self) -> Option<Duration> {
        self.nonempty().map(|h| Duration::from_nanos(h.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        self.nonempty().map(|h| Duration::from_nanos(h.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        self.nonempty().map(|h| Duration::from_nanos(h.mean() as u64))
    }

    fn nonempty(&self) -> Option<&Histogram<u64>> {
        self.histogram.as_ref().filter(|h| h.len() > 0)
    }
}

fn micros(d: Option<Duration>) -> f64 {
    d.map_or(0.0, |d| d.as_nanos() as f64 / 1000.0)
}

/// Serialized as a microsecond summary
impl Serialize for LatencyHistogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("LatencyHistogram", 7)?;
        s.serialize_field("samples", &self.len())?;
        s.serialize_field("min_us", &micros(self.min()))?;
        s.serialize_field("mean_us", &micros(self.mean()))?;
        s.serialize_field("p50_us", &micros(self.percentile(50.0)))?;
        s.serialize_field("p99_us", &micros(self.percentile(99.0)))?;
        s.serialize_field("p999_us", &micros(self.percentile(99.9)))?;
        s.serialize_field("max_us", &micros(self.max()))?;
        s.end()
    }
}
