//! The collector engine (spec.md section 4.3): periodic sampler execution bound to an
//! object, isolating sampler failures, and the two concrete collector shapes
//! (`AbstractMetricsCollector`, `AbstractMetaCollector`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::clock::CancelToken;
use crate::object::Object;
use crate::observability::TraceContext;

/// A sampler bound to a metrics-kind collector. Writes directly into the object's
/// metrics/events bins.
#[async_trait]
pub trait MetricSampler: Send + Sync {
    async fn sample(&self, obj: &Object) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// A sampler bound to a meta-kind collector. Returns the keys it wants merged into the
/// object's meta bag this cycle (spec.md section 4.3: "AbstractMetaCollector").
#[async_trait]
pub trait MetaSampler: Send + Sync {
    async fn sample(&self, obj: &Object) -> anyhow::Result<BTreeMap<String, Value>>;
    fn name(&self) -> &str;
}

/// Anything a collector owns that must be unblocked on `stop()` (spec.md section 4.2:
/// "closes any pipeline owned by a collector").
pub trait Stoppable: Send + Sync {
    fn stop(&self);
}

enum Samplers {
    Metric(Vec<Arc<dyn MetricSampler>>),
    Meta(Vec<Arc<dyn MetaSampler>>),
}

/// A fixed-interval registry of sampler methods (spec.md section 4.3).
pub struct Collector {
    interval: Duration,
    samplers: Samplers,
    /// Counters that should publish `0` every cycle when no data was written, keeping
    /// sparse series continuous (spec.md section 4.3: "zero_counters").
    zero_counters: Vec<String>,
    pipeline: Option<Arc<dyn Stoppable>>,
}

impl Collector {
    /// `AbstractMetricsCollector`: calls `status_update()` before sampling every cycle.
    pub fn metrics(interval: Duration, samplers: Vec<Arc<dyn MetricSampler>>, zero_counters: Vec<String>) -> Arc<Self> {
        Arc::new(Collector {
            interval,
            samplers: Samplers::Metric(samplers),
            zero_counters,
            pipeline: None,
        })
    }

    pub fn metrics_with_pipeline(
        interval: Duration,
        samplers: Vec<Arc<dyn MetricSampler>>,
        zero_counters: Vec<String>,
        pipeline: Arc<dyn Stoppable>,
    ) -> Arc<Self> {
        Arc::new(Collector {
            interval,
            samplers: Samplers::Metric(samplers),
            zero_counters,
            pipeline: Some(pipeline),
        })
    }

    /// `AbstractMetaCollector`: replaces the object's meta payload each cycle with
    /// `default_meta ∪ sampler_updates`.
    pub fn meta(interval: Duration, samplers: Vec<Arc<dyn MetaSampler>>) -> Arc<Self> {
        Arc::new(Collector {
            interval,
            samplers: Samplers::Meta(samplers),
            zero_counters: Vec::new(),
            pipeline: None,
        })
    }

    pub fn close_pipeline(&self) {
        if let Some(p) = &self.pipeline {
            p.stop();
        }
    }

    /// The run loop: while the object is running, increment an action id, run `_collect`
    /// (sampler timing/error isolation), then sleep for `interval` (spec.md section 4.3).
    pub async fn run(self: Arc<Self>, obj: Arc<Object>, cancel: CancelToken) {
        while obj.is_running() && !cancel.is_cancelled() {
            let _trace = TraceContext::next();
            self.collect_once(&obj).await;
            if !cancel.sleep(self.interval).await {
                break;
            }
        }
    }

    async fn collect_once(&self, obj: &Object) {
        match &self.samplers {
            Samplers::Metric(list) => {
                status_update(obj);
                for sampler in list {
                    if let Err(e) = sampler.sample(obj).await {
                        warn!(sampler = sampler.name(), error = %e, "sampler failed, isolating");
                    }
                }
                let mut bins = obj.bins.lock();
                for name in &self.zero_counters {
                    if !bins.metrics.has_written(name) {
                        bins.metrics.incr(name, 0.0, None, self.interval);
                    }
                }
            }
            Samplers::Meta(list) => {
                let mut merged = obj.default_meta.lock().clone();
                for sampler in list {
                    match sampler.sample(obj).await {
                        Ok(updates) => merged.extend(updates),
                        Err(e) => warn!(sampler = sampler.name(), error = %e, "meta sampler failed, isolating"),
                    }
                }
                obj.bins.lock().meta.set(merged);
            }
        }
    }
}

/// Emits an object-status latest metric before sampling (spec.md section 4.3:
/// "AbstractMetricsCollector").
fn status_update(obj: &Object) {
    obj.bins.lock().metrics.latest("object.status", 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Intervals, ObjectType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySampler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MetricSampler for FlakySampler {
        async fn sample(&self, obj: &Object) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("transient failure");
            }
            obj.bins.lock().metrics.gauge("ok", 1.0);
            Ok(())
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn sampler_failure_is_isolated_and_collector_keeps_running() {
        let obj = Arc::new(Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let collector = Collector::metrics(Duration::from_millis(5), vec![Arc::new(FlakySampler { calls: calls.clone() })], vec![]);
        obj.register_collector(collector.clone());

        collector.collect_once(&obj).await; // fails, isolated
        collector.collect_once(&obj).await; // succeeds
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(obj.bins.lock().metrics.flush().unwrap().contains_key("G|ok"));
    }

    #[tokio::test]
    async fn zero_counters_publish_when_untouched() {
        let obj = Arc::new(Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default()));
        let collector = Collector::metrics(Duration::from_millis(5), vec![], vec!["nginx.http.conn.dropped".to_string()]);
        collector.collect_once(&obj).await;
        let flushed = obj.bins.lock().metrics.flush().unwrap();
        assert_eq!(flushed["C|nginx.http.conn.dropped"].1, 0.0);
    }

    #[tokio::test]
    async fn status_update_emits_object_status_before_sampling() {
        let obj = Arc::new(Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default()));
        let collector = Collector::metrics(Duration::from_millis(5), vec![], vec![]);
        collector.collect_once(&obj).await;
        let flushed = obj.bins.lock().metrics.flush().unwrap();
        assert_eq!(flushed["G|object.status"].1, 1.0);
    }

    struct StaticMeta;

    #[async_trait]
    impl MetaSampler for StaticMeta {
        async fn sample(&self, _obj: &Object) -> anyhow::Result<BTreeMap<String, Value>> {
            let mut m = BTreeMap::new();
            m.insert("version".to_string(), Value::String("1.25.0".into()));
            Ok(m)
        }
        fn name(&self) -> &str {
            "static_meta"
        }
    }

    #[tokio::test]
    async fn meta_collector_merges_default_and_sampler_updates() {
        let obj = Arc::new(Object::new(ObjectType::Nginx, "root".into(), "id".into(), None, Intervals::default()));
        obj.default_meta.lock().insert("type".to_string(), Value::String("nginx".into()));
        let collector = Collector::meta(Duration::from_millis(5), vec![Arc::new(StaticMeta)]);
        collector.collect_once(&obj).await;
        let flushed = obj.bins.lock().meta.flush().unwrap();
        assert_eq!(flushed["type"], Value::String("nginx".into()));
        assert_eq!(flushed["version"], Value::String("1.25.0".into()));
    }
}
