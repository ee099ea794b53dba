//! The metrics bin: counter/gauge/timer/average/latest aggregation and flush math
//! (spec.md sections 3 and 4.3.1 -- the section marked "must be implemented exactly").

use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::clock::unix_timestamp;

/// One raw write accumulated since the last flush, before finalization.
#[derive(Debug, Clone)]
enum Record {
    /// `(timestamp, cumulative_or_incremental_value)` slots. Multiple slots appear only
    /// when rate-limiting is in effect; otherwise all writes collapse into one slot.
    Counter(Vec<(i64, f64)>),
    Gauge(Vec<(i64, f64)>),
    /// Raw histogram samples, unsorted until flush.
    Timer(Vec<f64>),
    Average(Vec<f64>),
    Latest(i64, f64),
}

/// Per-object accumulator for the four numeric metric kinds. Exclusively written by the
/// object's own collector tasks; read (and reset) only by the Bridge at flush time
/// (spec.md section 5, "Per-object mutability").
#[derive(Default)]
pub struct MetricsBin {
    current: IndexMap<String, Record>,
}

/// Name-prefixed metric value, matching the wire format the cloud endpoint expects
/// (`"G|name"`, `"C|name"`, ...). Each key maps to a single `(timestamp, value)` pair.
pub type FlushedMetrics = IndexMap<String, (i64, f64)>;

impl MetricsBin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by `value`. Negative deltas are discarded (spec.md section 3,
    /// section 8 invariant 2: "no negative delta is ever emitted").
    ///
    /// `rate`, combined with `interval`, collapses multiple writes within
    /// `interval * rate` into a single slot; outside that window a new slot starts.
    /// Without a rate, all writes within a flush cycle accumulate into one slot.
    pub fn incr(&mut self, name: &str, value: f64, rate: Option<f64>, interval: Duration) {
        self.incr_at(name, value, rate, interval, unix_timestamp())
    }

    fn incr_at(&mut self, name: &str, value: f64, rate: Option<f64>, interval: Duration, ts: i64) {
        if value < 0.0 {
            debug!(metric = name, value, "negative delta, skipping");
            return;
        }
        match self.current.entry(name.to_string()).or_insert_with(|| Record::Counter(Vec::new())) {
            Record::Counter(slots) => {
                if slots.is_empty() {
                    slots.push((ts, value));
                    return;
                }
                let (last_ts, last_val) = *slots.last().unwrap();
                if let Some(rate) = rate {
                    let sample_duration = interval.as_secs_f64() * rate;
                    if (ts as f64) < (last_ts as f64) + sample_duration {
                        let idx = slots.len() - 1;
                        slots[idx] = (last_ts, last_val + value);
                    } else {
                        slots.push((ts, value));
                    }
                } else {
                    let idx = slots.len() - 1;
                    slots[idx] = (last_ts, last_val + value);
                }
            }
            other => {
                debug!(metric = name, "type mismatch on incr, replacing slot kind");
                *other = Record::Counter(vec![(ts, value)]);
            }
        }
    }

    /// Record a point-in-time value. Repeated writes within a flush cycle are averaged
    /// together (spec.md section 3).
    pub fn gauge(&mut self, name: &str, value: f64) {
        self.gauge_at(name, value, unix_timestamp())
    }

    fn gauge_at(&mut self, name: &str, value: f64, ts: i64) {
        match self.current.entry(name.to_string()).or_insert_with(|| Record::Gauge(Vec::new())) {
            Record::Gauge(slots) => slots.push((ts, value)),
            other => *other = Record::Gauge(vec![(ts, value)]),
        }
    }

    /// Add a raw sample to a timer histogram.
    pub fn timer(&mut self, name: &str, value: f64) {
        match self.current.entry(name.to_string()).or_insert_with(|| Record::Timer(Vec::new())) {
            Record::Timer(samples) => samples.push(value),
            other => *other = Record::Timer(vec![value]),
        }
    }

    /// Add a raw sample to an average-only series (no percentiles emitted).
    pub fn average(&mut self, name: &str, value: f64) {
        match self.current.entry(name.to_string()).or_insert_with(|| Record::Average(Vec::new())) {
            Record::Average(samples) => samples.push(value),
            other => *other = Record::Average(vec![value]),
        }
    }

    /// Last-write-wins single value. Used both for ordinary latest-semantics metrics and
    /// for `status_update()`'s object-status heartbeat (spec.md section 4.3).
    pub fn latest(&mut self, name: &str, value: f64) {
        self.latest_at(name, value, unix_timestamp())
    }

    fn latest_at(&mut self, name: &str, value: f64, ts: i64) {
        match self.current.entry(name.to_string()).or_insert(Record::Latest(ts, value)) {
            Record::Latest(slot_ts, slot_val) if *slot_ts <= ts => {
                *slot_ts = ts;
                *slot_val = value;
            }
            other => *other = Record::Latest(ts, value),
        }
    }

    /// True if `name` has received any write since the last flush. Used by the collector
    /// engine to implement `zero_counters` (spec.md section 4.3).
    pub fn has_written(&self, name: &str) -> bool {
        self.current.contains_key(name)
    }

    /// Finalize all accumulated records into the wire format and clear the bin. Returns
    /// `None` if nothing was written since the last flush.
    pub fn flush(&mut self) -> Option<FlushedMetrics> {
        if self.current.is_empty() {
            return None;
        }
        let current = std::mem::take(&mut self.current);
        let mut out = FlushedMetrics::new();
        let now = unix_timestamp();

        for (name, record) in current {
            match record {
                Record::Counter(slots) => {
                    // Aggregate every slot accumulated since the last flush into one
                    // record, keyed by the oldest timestamp seen (spec.md section 4.3.1).
                    let oldest_ts = slots.first().map(|(t, _)| *t).unwrap_or(now);
                    let sum: f64 = slots.iter().map(|(_, v)| v).sum();
                    out.insert(format!("C|{name}"), (oldest_ts, sum));
                }
                Record::Gauge(slots) => {
                    let oldest_ts = slots.first().map(|(t, _)| *t).unwrap_or(now);
                    let mean = slots.iter().map(|(_, v)| v).sum::<f64>() / slots.len() as f64;
                    out.insert(format!("G|{name}"), (oldest_ts, mean));
                }
                Record::Timer(mut samples) => {
                    if samples.is_empty() {
                        continue;
                    }
                    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    let (base_name, suffix) = split_filter_suffix(&name);
                    let n = samples.len();
                    let mean = samples.iter().sum::<f64>() / n as f64;
                    out.insert(format!("G|{name}"), (now, mean));
                    out.insert(format!("C|{base_name}.count{suffix}"), (now, n as f64));
                    out.insert(format!("G|{base_name}.max{suffix}"), (now, samples[n - 1]));
                    out.insert(format!("G|{base_name}.median{suffix}"), (now, median_presorted(&samples)));
                    out.insert(format!("G|{base_name}.pctl95{suffix}"), (now, pctl95_presorted(&samples)));
                }
                Record::Average(samples) => {
                    if samples.is_empty() {
                        continue;
                    }
                    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                    out.insert(format!("G|{name}"), (now, mean));
                }
                Record::Latest(ts, value) => {
                    out.insert(format!("G|{name}"), (ts, value));
                }
            }
        }

        Some(out)
    }
}

/// Splits `"name||tag=value"` into `("name", "||tag=value")`. The filter suffix, when
/// present, is preserved on every derived timer metric name (spec.md section 4.3.1).
fn split_filter_suffix(name: &str) -> (&str, &str) {
    match name.find("||") {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn median_presorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// 95th percentile per spec.md section 4.3.1: `v[N - round(N*0.05)]`, 1-indexed from the
/// end, collapsing to the last (max) element when `N < 20`.
fn pctl95_presorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n < 20 {
        return sorted[n - 1];
    }
    let from_end = ((n as f64) * 0.05).round() as usize;
    let from_end = from_end.max(1);
    let pos = n.saturating_sub(from_end).min(n - 1);
    sorted[pos]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_timer_percentiles() {
        let mut bin = MetricsBin::new();
        for v in [0.1, 0.2, 0.3, 0.4, 0.5] {
            bin.timer("nginx.http.request.time", v);
        }
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["G|nginx.http.request.time"].1, 0.3);
        assert_eq!(flushed["C|nginx.http.request.time.count"].1, 5.0);
        assert_eq!(flushed["G|nginx.http.request.time.max"].1, 0.5);
        assert_eq!(flushed["G|nginx.http.request.time.median"].1, 0.3);
        assert_eq!(flushed["G|nginx.http.request.time.pctl95"].1, 0.5);
    }

    #[test]
    fn timer_filter_suffix_is_preserved() {
        let mut bin = MetricsBin::new();
        bin.timer("nginx.upstream.response.time||upstream=backend1", 1.0);
        bin.timer("nginx.upstream.response.time||upstream=backend1", 3.0);
        let flushed = bin.flush().unwrap();
        assert!(flushed.contains_key("G|nginx.upstream.response.time||upstream=backend1"));
        assert!(flushed.contains_key("C|nginx.upstream.response.time.count||upstream=backend1"));
        assert!(flushed.contains_key("G|nginx.upstream.response.time.max||upstream=backend1"));
    }

    #[test]
    fn counter_negative_delta_discarded() {
        let mut bin = MetricsBin::new();
        bin.incr_at("nginx.http.request.count", 5.0, None, Duration::from_secs(10), 1000);
        bin.incr_at("nginx.http.request.count", -3.0, None, Duration::from_secs(10), 1001);
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["C|nginx.http.request.count"].1, 5.0);
    }

    #[test]
    fn counter_aggregates_multiple_increments_since_last_flush() {
        let mut bin = MetricsBin::new();
        bin.incr_at("x", 1.0, None, Duration::from_secs(10), 1000);
        bin.incr_at("x", 2.0, None, Duration::from_secs(10), 1005);
        bin.incr_at("x", 3.0, None, Duration::from_secs(10), 1009);
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["C|x"], (1000, 6.0));
    }

    #[test]
    fn counter_rate_limiting_opens_new_slot_outside_window() {
        let mut bin = MetricsBin::new();
        let interval = Duration::from_secs(10);
        // interval*rate = 10*1 = 10s window.
        bin.incr_at("x", 1.0, Some(1.0), interval, 1000);
        bin.incr_at("x", 1.0, Some(1.0), interval, 1005); // within window -> collapses
        bin.incr_at("x", 1.0, Some(1.0), interval, 1020); // outside window -> new slot
        let flushed = bin.flush().unwrap();
        // Oldest slot timestamp (1000) and sum of all slots (1+1+1=3).
        assert_eq!(flushed["C|x"], (1000, 3.0));
    }

    #[test]
    fn gauge_averages_multiple_writes() {
        let mut bin = MetricsBin::new();
        bin.gauge_at("g", 10.0, 1000);
        bin.gauge_at("g", 20.0, 1001);
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["G|g"], (1000, 15.0));
    }

    #[test]
    fn latest_keeps_most_recent_write() {
        let mut bin = MetricsBin::new();
        bin.latest_at("l", 1.0, 1000);
        bin.latest_at("l", 2.0, 1005);
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["G|l"], (1005, 2.0));
    }

    #[test]
    fn average_reports_mean_without_percentiles() {
        let mut bin = MetricsBin::new();
        bin.average("a", 2.0);
        bin.average("a", 4.0);
        let flushed = bin.flush().unwrap();
        assert_eq!(flushed["G|a"].1, 3.0);
        assert!(!flushed.contains_key("C|a.count"));
    }

    #[test]
    fn empty_bin_flushes_to_none() {
        let mut bin = MetricsBin::new();
        assert!(bin.flush().is_none());
    }

    #[test]
    fn pctl95_below_twenty_samples_collapses_to_max() {
        let samples: Vec<f64> = (1..=19).map(|v| v as f64).collect();
        assert_eq!(pctl95_presorted(&samples), 19.0);
    }

    #[test]
    fn pctl95_at_twenty_samples_uses_formula() {
        let samples: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        // round(20*0.05) = 1 -> v[20-1] = v[19] = 20.0 (1-indexed from end = last element).
        assert_eq!(pctl95_presorted(&samples), 20.0);
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        // round(100*0.05) = 5 -> position (0-indexed) = 100-5 = 95 -> value 96.0
        assert_eq!(pctl95_presorted(&samples), 96.0);
    }
}
