//! `AbstractObject` and the object-type/identity model (spec.md sections 3, 4.2).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::clock::CancelToken;
use crate::collector::Collector;
use crate::databin::DataBins;

/// Registry-assigned, process-local, monotonically increasing id. Never reused while an
/// object is registered (spec.md section 3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tagged-variant replacement for the original's inheritance-based object classes
/// (spec.md section 9, "Dynamic dispatch / ad-hoc polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    System,
    Container,
    Nginx,
    ContainerNginx,
    Cache,
    StatusZone,
    Upstream,
    Slab,
    Stream,
    StreamUpstream,
    HttpCache,
    HttpServerZone,
    HttpUpstream,
    StreamServerZone,
    PhpFpm,
    PhpFpmPool,
    Mysql,
    /// Child objects of an `Nginx`/`ContainerNginx` object representing a discovered
    /// stub_status endpoint (spec.md section 4.5's "PlusStatus*" family).
    NginxStubStatus,
    NginxPlusStatus,
    NginxPlusApi,
}

impl ObjectType {
    /// True for the two object types allowed to be the tree root (spec.md section 3
    /// invariants: "Root is singular").
    pub fn is_root_candidate(self) -> bool {
        matches!(self, ObjectType::System | ObjectType::Container)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap();
        write!(f, "{}", s.as_str().unwrap())
    }
}

/// The externally visible identity of an object (spec.md section 3, GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(rename = "type")]
    pub obj_type: ObjectType,
    pub local_id: String,
    pub root_uuid: String,
}

impl Definition {
    /// SHA-256 over the sorted `key:value` tuple, used for equality across discovery
    /// passes (spec.md section 3: "definition hash").
    pub fn hash(&self) -> String {
        let mut pairs = vec![
            format!("type:{}", self.obj_type),
            format!("local_id:{}", self.local_id),
            format!("root_uuid:{}", self.root_uuid),
        ];
        pairs.sort();
        let joined = pairs.join(",");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// SHA-256 over an ordered tuple of type-specific identity arguments, e.g. for NGINX
/// `(binary_path, conf_path, prefix)` (spec.md section 3: "local_id").
pub fn local_id_hash(args: &[&str]) -> String {
    let joined = args.join("_");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-bin poll periods (spec.md section 3: "intervals").
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub meta: std::time::Duration,
    pub metrics: std::time::Duration,
    pub configs: std::time::Duration,
    pub logs: std::time::Duration,
    pub discover: std::time::Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        let ten = std::time::Duration::from_secs(10);
        Intervals {
            meta: ten,
            metrics: ten,
            configs: ten,
            logs: ten,
            discover: ten,
        }
    }
}

/// The monitored entity (spec.md section 3). Bins are exclusively written by this
/// object's own collector tasks; the Bridge reads them only through `flush()`
/// (spec.md section 5, "Per-object mutability").
pub struct Object {
    pub id: ObjectId,
    pub obj_type: ObjectType,
    pub root_uuid: String,
    pub local_id: String,
    pub name: Option<String>,
    pub intervals: Intervals,
    pub bins: Mutex<DataBins>,
    pub default_meta: Mutex<BTreeMap<String, Value>>,
    running: AtomicBool,
    need_restart: AtomicBool,
    cancel: CancelToken,
    collectors: Mutex<Vec<Arc<Collector>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Object {
    pub fn new(obj_type: ObjectType, root_uuid: String, local_id: String, name: Option<String>, intervals: Intervals) -> Self {
        Object {
            id: ObjectId(0),
            obj_type,
            root_uuid,
            local_id,
            name,
            intervals,
            bins: Mutex::new(DataBins::new()),
            default_meta: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            need_restart: AtomicBool::new(false),
            cancel: CancelToken::new(),
            collectors: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Only `ObjectTank::register` may set this, right after assigning the id.
    pub(crate) fn with_id(mut self, id: ObjectId) -> Self {
        self.id = id;
        self
    }

    pub fn definition(&self) -> Definition {
        Definition {
            obj_type: self.obj_type,
            local_id: self.local_id.clone(),
            root_uuid: self.root_uuid.clone(),
        }
    }

    pub fn definition_hash(&self) -> String {
        self.definition().hash()
    }

    /// A healthy definition has no empty/placeholder fields (spec.md section 4.8,
    /// "root object in unhealthy state").
    pub fn definition_healthy(&self) -> bool {
        !self.root_uuid.is_empty() && !self.local_id.is_empty()
    }

    pub fn display_name(&self, system_identifier: &str) -> String {
        match &self.name {
            Some(name) => format!("{} {} @ {}", self.obj_type, name, system_identifier),
            None => format!("{} @ {}", self.obj_type, system_identifier),
        }
    }

    pub fn register_collector(&self, collector: Arc<Collector>) {
        self.collectors.lock().push(collector);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mark_need_restart(&self) {
        self.need_restart.store(true, Ordering::SeqCst);
    }

    pub fn needs_restart(&self) -> bool {
        self.need_restart.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Starts all collector tasks. Idempotent (spec.md section 4.2: "Starting idempotent").
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(object_id = %self.id, obj_type = %self.obj_type, "starting object");
        let collectors = self.collectors.lock().clone();
        let mut tasks = self.tasks.lock();
        for collector in collectors {
            let obj = Arc::clone(self);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                collector.run(obj, cancel).await;
            }));
        }
    }

    /// Stops all collector tasks and closes any pipeline they own
    /// (spec.md section 4.2, section 5 "Cancellation").
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(object_id = %self.id, obj_type = %self.obj_type, "stopping object");
        self.cancel.cancel();
        let collectors = self.collectors.lock().clone();
        for collector in &collectors {
            collector.close_pipeline();
        }
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// `AbstractObject::flush(clients)` (spec.md section 4.2).
    pub fn flush(&self, clients: &[&str]) -> Option<Value> {
        self.bins.lock().flush(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_hash_is_stable_for_same_inputs() {
        let d1 = Definition {
            obj_type: ObjectType::Nginx,
            local_id: "abc".into(),
            root_uuid: "root-1".into(),
        };
        let d2 = d1.clone();
        assert_eq!(d1.hash(), d2.hash());
    }

    #[test]
    fn definition_hash_differs_on_local_id() {
        let base = Definition {
            obj_type: ObjectType::Nginx,
            local_id: "abc".into(),
            root_uuid: "root-1".into(),
        };
        let mut other = base.clone();
        other.local_id = "def".into();
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn local_id_hash_is_order_sensitive() {
        let a = local_id_hash(&["/usr/sbin/nginx", "/etc/nginx/nginx.conf", "/etc/nginx"]);
        let b = local_id_hash(&["/etc/nginx", "/etc/nginx/nginx.conf", "/usr/sbin/nginx"]);
        assert_ne!(a, b);
    }

    #[test]
    fn display_name_includes_optional_name() {
        let obj = Object::new(ObjectType::Upstream, "root".into(), "id".into(), Some("backend".into()), Intervals::default());
        assert_eq!(obj.display_name("host1"), "upstream backend @ host1");
        let anon = Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default());
        assert_eq!(anon.display_name("host1"), "system @ host1");
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_running() {
        let obj = Arc::new(Object::new(ObjectType::System, "root".into(), "id".into(), None, Intervals::default()));
        obj.start();
        obj.start();
        assert!(obj.is_running());
        obj.stop().await;
        assert!(!obj.is_running());
    }
}
