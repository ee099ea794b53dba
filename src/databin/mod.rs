//! The four per-object data bins (spec.md section 3, "DataBin kinds and semantics").

mod configs;
mod events;
mod meta;
mod metrics;

pub use configs::ConfigsBin;
pub use events::{Event, EventLevel, EventsBin};
pub use meta::MetaBin;
pub use metrics::{FlushedMetrics, MetricsBin};

use serde_json::{json, Value};

/// The bundle of bins owned exclusively by one `AbstractObject` (spec.md section 4.2).
#[derive(Default)]
pub struct DataBins {
    pub metrics: MetricsBin,
    pub events: EventsBin,
    pub meta: MetaBin,
    pub configs: ConfigsBin,
}

/// Names accepted by `AbstractObject::flush(clients)` (spec.md section 4.2).
pub const BIN_NAMES: [&str; 4] = ["meta", "metrics", "events", "configs"];

impl DataBins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush a single named bin to a JSON value, or `None` if it produced nothing.
    pub fn flush_one(&mut self, name: &str) -> Option<Value> {
        match name {
            "meta" => self.meta.flush().map(|m| json!(m)),
            "metrics" => self.metrics.flush().map(|m| {
                let obj: serde_json::Map<String, Value> = m
                    .into_iter()
                    .map(|(k, (ts, v))| (k, json!([[ts, v]])))
                    .collect();
                Value::Object(obj)
            }),
            "events" => self.events.flush().map(|e| json!(e)),
            "configs" => self.configs.flush().map(|(payload, checksum)| {
                json!({ "payload": payload, "checksum": checksum })
            }),
            _ => None,
        }
    }

    /// `AbstractObject::flush(clients)` per spec.md section 4.2:
    /// - empty `clients` -> flush every bin, returning a map keyed by bin name.
    /// - multiple named clients -> filtered map.
    /// - exactly one named client -> the bin's raw flush value, unwrapped.
    pub fn flush(&mut self, clients: &[&str]) -> Option<Value> {
        if clients.is_empty() {
            let mut out = serde_json::Map::new();
            for name in BIN_NAMES {
                if let Some(v) = self.flush_one(name) {
                    out.insert(name.to_string(), v);
                }
            }
            return if out.is_empty() { None } else { Some(Value::Object(out)) };
        }

        if clients.len() == 1 {
            return self.flush_one(clients[0]);
        }

        let mut out = serde_json::Map::new();
        for name in clients {
            if let Some(v) = self.flush_one(name) {
                out.insert((*name).to_string(), v);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Value::Object(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_client_flush_is_unwrapped() {
        let mut bins = DataBins::new();
        bins.events.push(EventLevel::Info, "started");
        let flushed = bins.flush(&["events"]);
        assert!(flushed.unwrap().is_array());
    }

    #[test]
    fn multi_client_flush_is_a_filtered_map() {
        let mut bins = DataBins::new();
        bins.events.push(EventLevel::Info, "started");
        bins.meta.set(Default::default());
        let flushed = bins.flush(&["events", "configs"]).unwrap();
        assert!(flushed.get("events").is_some());
        assert!(flushed.get("configs").is_none());
        assert!(flushed.get("meta").is_none());
    }

    #[test]
    fn empty_clients_flushes_everything_nonempty() {
        let mut bins = DataBins::new();
        bins.meta.set(Default::default());
        let flushed = bins.flush(&[]).unwrap();
        assert!(flushed.get("meta").is_some());
        assert!(flushed.get("events").is_none());
    }

    #[test]
    fn all_empty_bins_flush_to_none() {
        let mut bins = DataBins::new();
        assert!(bins.flush(&[]).is_none());
    }

    #[test]
    fn configs_bin_serializes_payload_and_checksum() {
        let mut bins = DataBins::new();
        bins.configs.set(json!({"a": 1}), "abc");
        let flushed = bins.flush(&["configs"]).unwrap();
        assert_eq!(flushed["checksum"], json!("abc"));
    }
}
