//! The System/container object's meta and metrics collectors (spec.md section 2's
//! "System/Plus/API collectors" row; grounded on the original `SystemMetricsCollector`/
//! `SystemMetaCollector`).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::collector::{MetaSampler, MetricSampler};
use crate::object::Object;
use crate::probe::Probe;

/// `controller.agent.*`, `system.mem.*`, `system.cpu.*`, `system.disk.*`,
/// `system.net.*` (grounded on `SystemMetricsCollector`).
pub struct SystemMetrics {
    probe: Arc<dyn Probe>,
    is_container: bool,
}

impl SystemMetrics {
    pub fn new(probe: Arc<dyn Probe>, is_container: bool) -> Self {
        SystemMetrics { probe, is_container }
    }
}

#[async_trait]
impl MetricSampler for SystemMetrics {
    async fn sample(&self, obj: &Object) -> anyhow::Result<()> {
        if self.is_container {
            obj.bins.lock().metrics.latest("controller.agent.container.count", 1.0);
        }

        let own_cpu = self.probe.own_cpu_percent(std::time::Duration::from_millis(200)).await?;
        obj.bins.lock().metrics.gauge("controller.agent.cpu.total", own_cpu);

        for iface in self.probe.network_interfaces().await? {
            let mut bins = obj.bins.lock();
            bins.metrics.gauge(&format!("system.net.bytes_rcvd|{}", iface.name), iface.rx_bytes as f64);
            bins.metrics.gauge(&format!("system.net.bytes_sent|{}", iface.name), iface.tx_bytes as f64);
        }

        for part in self.probe.disk_partitions().await? {
            let mut bins = obj.bins.lock();
            bins.metrics.gauge(&format!("system.disk.used|{}", part.mount_point), part.used_bytes as f64);
            bins.metrics.gauge(&format!("system.disk.total|{}", part.mount_point), part.total_bytes as f64);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "system_metrics"
    }
}

/// Static host identity fields merged into the object's meta bag each cycle
/// (grounded on `SystemMetaCollector`).
pub struct SystemMeta {
    pub hostname: String,
    pub os_type: String,
    pub os_version: String,
}

#[async_trait]
impl MetaSampler for SystemMeta {
    async fn sample(&self, _obj: &Object) -> anyhow::Result<BTreeMap<String, Value>> {
        let mut m = BTreeMap::new();
        m.insert("hostname".to_string(), Value::String(self.hostname.clone()));
        m.insert("type".to_string(), Value::String(self.os_type.clone()));
        m.insert("version".to_string(), Value::String(self.os_version.clone()));
        Ok(m)
    }

    fn name(&self) -> &str {
        "system_meta"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Intervals, ObjectType};
    use crate::probe::FakeProbe;
    use std::collections::HashMap;

    #[tokio::test]
    async fn system_metrics_sampler_writes_agent_and_net_gauges() {
        let obj = Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default());
        let probe: Arc<dyn Probe> = Arc::new(FakeProbe { processes: vec![], memory: HashMap::new() });
        let sampler = SystemMetrics::new(probe, false);
        sampler.sample(&obj).await.unwrap();
        let flushed = obj.bins.lock().metrics.flush().unwrap();
        assert!(flushed.contains_key("G|controller.agent.cpu.total"));
    }

    #[tokio::test]
    async fn system_metrics_emits_container_count_only_when_in_container() {
        let obj = Object::new(ObjectType::Container, "root".into(), "id".into(), None, Intervals::default());
        let probe: Arc<dyn Probe> = Arc::new(FakeProbe { processes: vec![], memory: HashMap::new() });
        let sampler = SystemMetrics::new(probe, true);
        sampler.sample(&obj).await.unwrap();
        let flushed = obj.bins.lock().metrics.flush().unwrap();
        assert!(flushed.contains_key("G|controller.agent.container.count"));
    }

    #[tokio::test]
    async fn system_meta_sampler_reports_host_identity() {
        let obj = Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default());
        let sampler = SystemMeta {
            hostname: "host1".to_string(),
            os_type: "linux".to_string(),
            os_version: "6.1.0".to_string(),
        };
        let updates = sampler.sample(&obj).await.unwrap();
        assert_eq!(updates["hostname"], Value::String("host1".to_string()));
    }
}
