//! The system-object manager (spec.md section 4.4, 4.8 manager init order's `system`
//! entry): registers the single root `System` object once and attaches its meta/metrics
//! collectors. Grounded on `manager.rs`'s `AbstractManager` plus `system.rs`'s samplers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::collector::Collector;
use crate::manager::AbstractManager;
use crate::object::{Intervals, Object, ObjectType};
use crate::probe::Probe;
use crate::system::{SystemMeta, SystemMetrics};
use crate::tank::ObjectTank;

/// Discovers and registers exactly one `System` object (spec.md section 3, "root is
/// singular"); a container host would register `ObjectType::Container` instead, per
/// SPEC_FULL.md C -- left to a future extension as this agent always runs host-resident.
pub struct SystemManager {
    probe: Arc<dyn Probe>,
    root_uuid: String,
    intervals: Intervals,
    is_container: bool,
    registered: AtomicBool,
}

impl SystemManager {
    pub fn new(probe: Arc<dyn Probe>, root_uuid: String, intervals: Intervals, is_container: bool) -> Self {
        SystemManager { probe, root_uuid, intervals, is_container, registered: AtomicBool::new(false) }
    }
}

#[async_trait]
impl AbstractManager for SystemManager {
    fn interval(&self) -> Duration {
        self.intervals.discover
    }

    async fn run_once(&self, tank: &ObjectTank) {
        if self.registered.load(Ordering::SeqCst) {
            return;
        }
        if tank.root_id().is_some() {
            // Another manager (e.g. a container manager in a future extension) already
            // claimed the root slot this boot.
            self.registered.store(true, Ordering::SeqCst);
            return;
        }

        let obj = Object::new(ObjectType::System, self.root_uuid.clone(), "system".to_string(), None, self.intervals);
        let Ok(registered) = tank.register(obj, None) else {
            return;
        };

        registered.register_collector(Collector::metrics(
            self.intervals.metrics,
            vec![Arc::new(SystemMetrics::new(self.probe.clone(), self.is_container))],
            vec![],
        ));
        registered.register_collector(Collector::meta(
            self.intervals.meta,
            vec![Arc::new(SystemMeta {
                hostname: host_identity(),
                os_type: std::env::consts::OS.to_string(),
                os_version: std::fs::read_to_string("/proc/version").unwrap_or_default().trim().to_string(),
            })],
        ));
        registered.start();

        info!(object_id = %registered.id, "registered system object");
        self.registered.store(true, Ordering::SeqCst);
    }
}

/// Best-effort host identifier for the meta sampler (spec.md section 6:
/// `credentials.hostname` is preferred when configured; this is the fallback).
fn host_identity() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DiskPartition, NetworkInterface, ProcessInfo, ProcessMemory};

    struct FakeProbe;

    #[async_trait]
    impl Probe for FakeProbe {
        async fn list_processes(&self) -> anyhow::Result<Vec<ProcessInfo>> {
            Ok(vec![])
        }
        async fn process_memory(&self, _pid: i32) -> anyhow::Result<ProcessMemory> {
            Ok(ProcessMemory::default())
        }
        async fn process_cpu_percent(&self, _pid: i32) -> anyhow::Result<f64> {
            Ok(0.0)
        }
        async fn process_fd_count(&self, _pid: i32) -> anyhow::Result<u32> {
            Ok(0)
        }
        async fn disk_partitions(&self) -> anyhow::Result<Vec<DiskPartition>> {
            Ok(vec![])
        }
        async fn network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>> {
            Ok(vec![])
        }
        async fn own_cpu_percent(&self, _window: Duration) -> anyhow::Result<f64> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn registers_exactly_one_system_object() {
        let tank = ObjectTank::new();
        let manager = SystemManager::new(Arc::new(FakeProbe), "root-uuid".to_string(), Intervals::default(), false);

        manager.run_once(&tank).await;
        manager.run_once(&tank).await;

        assert_eq!(tank.find_all_by_type(ObjectType::System).len(), 1);
    }
}
