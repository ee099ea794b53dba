//! The concrete NGINX manager (spec.md section 4.4, 4.5 -- the two heaviest-weighted
//! pieces of the module map): discovers host nginx master processes, registers one
//! `Nginx` object per distinct `(binary, conf, prefix)` triple, and attaches the
//! meta/metrics/log collectors that make it a live telemetry source. Grounded on
//! `system_manager.rs`'s structural pattern plus the discovery primitives in
//! `manager.rs`/`nginx.rs`/`configparser.rs`/`plus.rs`/`pipeline/*`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::collector::{Collector, MetaSampler, MetricSampler, Stoppable};
use crate::config::ConfigTank;
use crate::configparser::{ConfigParser, NginxConfigParser};
use crate::httpclient::HTTPClient;
use crate::manager::{classify, effective_launchers, launcher_allowed, AbstractManager, DiscoveryEvent};
use crate::nginx::{discover_endpoints, parse_nginx_v_output, probe_first_alive, status_directive_supported, NginxBuildInfo};
use crate::object::{local_id_hash, Intervals, Object, ObjectId, ObjectType};
use crate::pipeline::accesslog::{derive_metrics, AccessLogFormat, COMBINED_FORMAT};
use crate::pipeline::errorlog;
use crate::pipeline::filetail::FileTail;
use crate::plus::{extractor_registry, parse_stub_status, PlusCache};
use crate::probe::{Probe, ProcessInfo};
use crate::subprocess::SubprocessRunner;
use crate::tank::ObjectTank;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_CONF_PATH: &str = "/etc/nginx/nginx.conf";
const DEFAULT_PREFIX: &str = "/etc/nginx";
const DEFAULT_ACCESS_LOG: &str = "/var/log/nginx/access.log";
const DEFAULT_ERROR_LOG: &str = "/var/log/nginx/error.log";

struct Tracked {
    pid: i32,
    object_id: ObjectId,
}

/// Discovers and registers nginx master processes (spec.md section 4.4: "manager
/// discovers host entities, classifies New/Restarted/Reloaded/Gone").
pub struct NginxManager {
    probe: Arc<dyn Probe>,
    subprocess: Arc<dyn SubprocessRunner>,
    http: Arc<dyn HTTPClient>,
    config: ConfigTank,
    root_uuid: String,
    intervals: Intervals,
    tracked: Mutex<HashMap<String, Tracked>>,
}

impl NginxManager {
    pub fn new(
        probe: Arc<dyn Probe>,
        subprocess: Arc<dyn SubprocessRunner>,
        http: Arc<dyn HTTPClient>,
        config: ConfigTank,
        root_uuid: String,
        intervals: Intervals,
    ) -> Self {
        NginxManager { probe, subprocess, http, config, root_uuid, intervals, tracked: Mutex::new(HashMap::new()) }
    }

    async fn discover_masters(&self) -> Vec<ProcessInfo> {
        match self.probe.list_processes().await {
            Ok(procs) => procs.into_iter().filter(is_master).collect(),
            Err(e) => {
                warn!(error = %e, "failed to list host processes for nginx discovery");
                Vec::new()
            }
        }
    }

    /// Resolves the real binary behind `pid` and runs `-V` against it (spec.md section
    /// 4.5: "nginx_v()" is the source of version, Plus flags, and configure arguments).
    async fn binary_and_build(&self, pid: i32) -> Option<(String, NginxBuildInfo)> {
        let exe = tokio::fs::read_link(format!("/proc/{pid}/exe")).await.ok()?;
        let binary_path = exe.to_string_lossy().to_string();
        let result = self.subprocess.run(&binary_path, &["-V"], SUBPROCESS_TIMEOUT).await.ok()?;
        let build = parse_nginx_v_output(&result.stderr_lines.join("\n"));
        Some((binary_path, build))
    }

    async fn register_nginx(
        &self,
        tank: &ObjectTank,
        pid: i32,
        binary_path: &str,
        build: NginxBuildInfo,
        conf_path: PathBuf,
        prefix: String,
        local_id: String,
    ) {
        let Some(root_id) = tank.root_id() else {
            // The system manager hasn't claimed the root slot yet this boot; retry next poll.
            return;
        };

        let obj = Object::new(ObjectType::Nginx, self.root_uuid.clone(), local_id.clone(), None, self.intervals);
        let registered = match tank.register(obj, Some(root_id)) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, local_id = %local_id, "failed to register nginx object");
                return;
            }
        };

        let (initial_access_log, initial_error_log) = NginxConfigParser
            .parse(&conf_path)
            .map(|parsed| (parsed.access_logs.into_iter().next(), parsed.error_logs.into_iter().next()))
            .unwrap_or((None, None));

        registered.register_collector(Collector::meta(
            self.intervals.meta,
            vec![Arc::new(NginxMeta { build: build.clone(), conf_path: conf_path.clone(), prefix })],
        ));

        let metrics_sampler = Arc::new(NginxMetricsSampler::new(self.http.clone(), conf_path.clone(), build));
        registered.register_collector(Collector::metrics(self.intervals.metrics, vec![metrics_sampler], vec![]));

        let access_path = initial_access_log.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_ACCESS_LOG));
        match FileTail::open(&access_path) {
            Ok(tail) => {
                let tail = Arc::new(Mutex::new(tail));
                let sampler = Arc::new(NginxAccessLogSampler::new(tail.clone()));
                registered.register_collector(Collector::metrics_with_pipeline(
                    self.intervals.logs,
                    vec![sampler],
                    vec![],
                    Arc::new(TailHandle(tail)),
                ));
            }
            Err(e) => warn!(error = %e, path = %access_path.display(), "access log not tailable yet"),
        }

        let error_path = initial_error_log.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_ERROR_LOG));
        match FileTail::open(&error_path) {
            Ok(tail) => {
                let tail = Arc::new(Mutex::new(tail));
                let sampler = Arc::new(NginxErrorLogSampler::new(tail.clone()));
                registered.register_collector(Collector::metrics_with_pipeline(
                    self.intervals.logs,
                    vec![sampler],
                    errorlog::ZERO_COUNTERS.iter().map(|s| s.to_string()).collect(),
                    Arc::new(TailHandle(tail)),
                ));
            }
            Err(e) => warn!(error = %e, path = %error_path.display(), "error log not tailable yet"),
        }

        registered.start();
        self.tracked.lock().insert(local_id, Tracked { pid, object_id: registered.id });
        info!(object_id = %registered.id, pid, binary_path, "registered nginx object");
    }
}

#[async_trait]
impl AbstractManager for NginxManager {
    fn interval(&self) -> Duration {
        self.intervals.discover
    }

    async fn run_once(&self, tank: &ObjectTank) {
        let snapshot = self.config.snapshot();
        let launchers = effective_launchers(&snapshot.agent_launchers);
        let masters = self.discover_masters().await;
        let mut seen_local_ids: HashSet<String> = HashSet::new();

        for proc in &masters {
            if !launcher_allowed(proc.ppid, self.subprocess.as_ref(), &launchers, SUBPROCESS_TIMEOUT).await.unwrap_or(false) {
                continue;
            }

            let Some((binary_path, build)) = self.binary_and_build(proc.pid).await else {
                continue;
            };
            let conf_path =
                PathBuf::from(build.configure_arguments.get("conf-path").cloned().unwrap_or_else(|| DEFAULT_CONF_PATH.to_string()));
            let prefix = build.configure_arguments.get("prefix").cloned().unwrap_or_else(|| DEFAULT_PREFIX.to_string());
            let local_id = local_id_hash(&[&binary_path, conf_path.to_string_lossy().as_ref(), &prefix]);
            seen_local_ids.insert(local_id.clone());

            let existing = self.tracked.lock().get(&local_id).map(|t| (t.pid, t.object_id));
            match existing {
                None => {
                    self.register_nginx(tank, proc.pid, &binary_path, build, conf_path, prefix, local_id).await;
                }
                Some((existing_pid, object_id)) => {
                    let needs_restart = tank.find_one(object_id).map(|o| o.needs_restart()).unwrap_or(false);
                    match classify(existing_pid, needs_restart, proc.pid) {
                        DiscoveryEvent::Restarted { old_pid, new_pid } => {
                            info!(local_id = %local_id, old_pid, new_pid, "nginx master process restarted");
                            if let Some(t) = self.tracked.lock().get_mut(&local_id) {
                                t.pid = new_pid;
                            }
                        }
                        DiscoveryEvent::Reloaded => {
                            info!(local_id = %local_id, "nginx config reload detected");
                        }
                        DiscoveryEvent::New | DiscoveryEvent::Unchanged | DiscoveryEvent::Gone => {}
                    }
                }
            }
        }

        let gone: Vec<(String, ObjectId)> = {
            let tracked = self.tracked.lock();
            tracked.iter().filter(|(id, _)| !seen_local_ids.contains(*id)).map(|(id, t)| (id.clone(), t.object_id)).collect()
        };
        for (local_id, object_id) in gone {
            info!(local_id = %local_id, "nginx master process gone, unregistering");
            tank.unregister(object_id).await;
            self.tracked.lock().remove(&local_id);
        }
    }
}

/// True for a master process, never a worker (spec.md section 4.4: workers share the
/// master's definition and must not be registered separately). nginx rewrites argv so
/// the rewritten title, not argv[0], carries this marker.
fn is_master(proc: &ProcessInfo) -> bool {
    proc.cmdline.iter().any(|a| a.contains("nginx:") && a.contains("master process"))
}

/// Static-ish meta: version/Plus flags plus the resolved conf path and prefix
/// (spec.md section 4.5, grounded on the original `NginxObject`'s meta fields).
struct NginxMeta {
    build: NginxBuildInfo,
    conf_path: PathBuf,
    prefix: String,
}

#[async_trait]
impl MetaSampler for NginxMeta {
    async fn sample(&self, _obj: &Object) -> anyhow::Result<std::collections::BTreeMap<String, Value>> {
        let mut m = std::collections::BTreeMap::new();
        if let Some(version) = &self.build.version {
            m.insert("version".to_string(), Value::String(version.clone()));
        }
        m.insert("plus_enabled".to_string(), Value::Bool(self.build.plus_enabled));
        if let Some(release) = &self.build.plus_release {
            m.insert("plus_release".to_string(), Value::String(release.clone()));
        }
        m.insert("conf_path".to_string(), Value::String(self.conf_path.display().to_string()));
        m.insert("prefix".to_string(), Value::String(self.prefix.clone()));
        Ok(m)
    }

    fn name(&self) -> &str {
        "nginx_meta"
    }
}

/// Periodically reparses the config (gated by a `ConfigCoordinator`), rediscovers
/// stub_status/Plus status endpoints, and samples whichever ones answer
/// (spec.md section 4.5, section 6).
struct NginxMetricsSampler {
    http: Arc<dyn HTTPClient>,
    conf_path: PathBuf,
    state: Mutex<NginxMetricsState>,
    discovered_endpoints: Mutex<Option<crate::nginx::DiscoveredEndpoints>>,
}

struct NginxMetricsState {
    coordinator: crate::nginx::ConfigCoordinator,
    build: NginxBuildInfo,
    stub_status_url: Option<String>,
    plus_status_url: Option<String>,
    plus_cache: PlusCache,
}

impl NginxMetricsSampler {
    fn new(http: Arc<dyn HTTPClient>, conf_path: PathBuf, build: NginxBuildInfo) -> Self {
        NginxMetricsSampler {
            http,
            conf_path,
            state: Mutex::new(NginxMetricsState {
                coordinator: crate::nginx::ConfigCoordinator::new(Duration::from_secs(60)),
                build,
                stub_status_url: None,
                plus_status_url: None,
                plus_cache: PlusCache::new(),
            }),
            discovered_endpoints: Mutex::new(None),
        }
    }

    /// Re-parses and rediscovers endpoints when the config's fingerprint has changed
    /// (spec.md section 4.5: "Config collector parse gate").
    fn maybe_rediscover(&self) {
        let Ok(fingerprint) = NginxConfigParser.inventory(&self.conf_path) else {
            return;
        };
        let mut state = self.state.lock();
        if !state.coordinator.fingerprint_changed(&fingerprint) {
            return;
        }
        let parse_start = crate::clock::unix_timestamp();
        let Ok(parsed) = NginxConfigParser.parse(&self.conf_path) else {
            return;
        };
        let allowed = status_directive_supported(&state.build);
        let discovered = discover_endpoints(&parsed, allowed);
        state.coordinator.record_parse(parse_start, Duration::from_secs(0), fingerprint);
        // Endpoints changed shape; clear cached liveness so probe_first_alive runs again.
        state.stub_status_url = None;
        state.plus_status_url = None;
        drop(state);
        self.discovered_endpoints.lock().replace(discovered);
    }
}

#[async_trait]
impl MetricSampler for NginxMetricsSampler {
    async fn sample(&self, obj: &Object) -> anyhow::Result<()> {
        self.maybe_rediscover();

        let discovered = self.discovered_endpoints.lock().clone();
        let Some(discovered) = discovered else {
            return Ok(());
        };

        // Probing is async, so the lock is never held across an `.await` point --
        // `parking_lot::Mutex`'s guard isn't `Send` and can't cross a suspension.
        let (need_stub, need_plus) = {
            let state = self.state.lock();
            (state.stub_status_url.is_none(), state.plus_status_url.is_none())
        };

        let resolved_stub = if need_stub {
            let mut urls = discovered.stub_status.internal.clone();
            urls.extend(discovered.stub_status.external.clone());
            probe_first_alive(self.http.as_ref(), &urls, PROBE_TIMEOUT, |body| parse_stub_status(body).is_some()).await
        } else {
            None
        };
        let resolved_plus = if need_plus {
            let mut urls = discovered.plus_status.internal.clone();
            urls.extend(discovered.plus_status.external.clone());
            probe_first_alive(self.http.as_ref(), &urls, PROBE_TIMEOUT, |body| serde_json::from_str::<Value>(body).is_ok()).await
        } else {
            None
        };

        let (stub_url, plus_url) = {
            let mut state = self.state.lock();
            if need_stub {
                state.stub_status_url = resolved_stub;
            }
            if need_plus {
                state.plus_status_url = resolved_plus;
            }
            (state.stub_status_url.clone(), state.plus_status_url.clone())
        };

        if let Some(url) = stub_url {
            if let Ok(resp) = self.http.get(&url, PROBE_TIMEOUT).await {
                if let Some(status) = parse_stub_status(&resp.text()) {
                    let mut bins = obj.bins.lock();
                    bins.metrics.gauge("nginx.net.conn_cur", status.active() as f64);
                    bins.metrics.gauge("nginx.net.conn_idle", status.waiting as f64);
                    bins.metrics.gauge("nginx.net.request_cur", status.requests as f64);
                    bins.metrics.incr("nginx.net.conn_dropped_count", status.dropped() as f64, None, obj.intervals.metrics);
                    bins.metrics.incr("nginx.net.conn_accepted_count", status.accepts as f64, None, obj.intervals.metrics);
                    bins.metrics.incr("nginx.http.request_count", status.requests as f64, None, obj.intervals.metrics);
                }
            }
        }

        if let Some(url) = plus_url {
            if let Ok(resp) = self.http.get(&url, PROBE_TIMEOUT).await {
                let body = resp.text();
                if let Ok(value) = serde_json::from_str::<Value>(&body) {
                    let now = crate::clock::unix_timestamp();
                    let mut state = self.state.lock();
                    state.plus_cache.put(&url, value.clone(), now);
                    drop(state);

                    let mut bins = obj.bins.lock();
                    for (name, extractor) in extractor_registry() {
                        if let Some(extracted) = extractor(&value) {
                            if let Some(n) = extracted.as_f64() {
                                bins.metrics.gauge(&format!("nginx.plus.{name}"), n);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "nginx_metrics"
    }
}

/// Tails the first discovered access log, deriving counters per line
/// (spec.md section 4.6, S2).
struct NginxAccessLogSampler {
    tail: Arc<Mutex<FileTail>>,
    format: AccessLogFormat,
}

impl NginxAccessLogSampler {
    fn new(tail: Arc<Mutex<FileTail>>) -> Self {
        NginxAccessLogSampler { tail, format: AccessLogFormat::compile(COMBINED_FORMAT) }
    }
}

#[async_trait]
impl MetricSampler for NginxAccessLogSampler {
    async fn sample(&self, obj: &Object) -> anyhow::Result<()> {
        let lines = self.tail.lock().readlines()?;
        let mut bins = obj.bins.lock();
        for line in lines {
            let Some(fields) = self.format.parse_line(&line) else {
                continue;
            };
            for (name, value) in derive_metrics(&fields) {
                bins.metrics.incr(&name, value, None, obj.intervals.logs);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "nginx_access_log"
    }
}

/// Tails the first discovered error log, classifying each line into a zero-filled
/// counter (spec.md section 4.6, S5).
struct NginxErrorLogSampler {
    tail: Arc<Mutex<FileTail>>,
}

impl NginxErrorLogSampler {
    fn new(tail: Arc<Mutex<FileTail>>) -> Self {
        NginxErrorLogSampler { tail }
    }
}

#[async_trait]
impl MetricSampler for NginxErrorLogSampler {
    async fn sample(&self, obj: &Object) -> anyhow::Result<()> {
        let lines = self.tail.lock().readlines()?;
        let mut bins = obj.bins.lock();
        for line in lines {
            if let Some(counter) = errorlog::classify(&line) {
                bins.metrics.incr(counter, 1.0, None, obj.intervals.logs);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "nginx_error_log"
    }
}

/// Bridges a `FileTail` owned by a sampler to the `Collector`'s `Stoppable` pipeline
/// handle, so `Object::stop()` unblocks it (spec.md section 4.2).
struct TailHandle(Arc<Mutex<FileTail>>);

impl Stoppable for TailHandle {
    fn stop(&self) {
        self.0.lock().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpclient::HttpResponse;
    use crate::probe::{DiskPartition, NetworkInterface, ProcessMemory};
    use crate::subprocess::SubprocessResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        processes: Vec<ProcessInfo>,
    }

    #[async_trait]
    impl Probe for FakeProbe {
        async fn list_processes(&self) -> anyhow::Result<Vec<ProcessInfo>> {
            Ok(self.processes.clone())
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

    struct FakeRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubprocessRunner for FakeRunner {
        async fn run(&self, _program: &str, _args: &[&str], _timeout: Duration) -> anyhow::Result<SubprocessResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubprocessResult {
                stdout_lines: vec![],
                stderr_lines: vec!["nginx version: nginx/1.25.3".to_string()],
                returncode: 0,
            })
        }
    }

    struct FakeHttp;

    #[async_trait]
    impl HTTPClient for FakeHttp {
        async fn post_json(&self, _url: &str, _body: &[u8], _gzip: bool) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse { status: 200, body: vec![] })
        }
        async fn get(&self, _url: &str, _timeout: Duration) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse { status: 404, body: vec![] })
        }
    }

    fn intervals() -> Intervals {
        Intervals::default()
    }

    #[test]
    fn is_master_matches_rewritten_title_only() {
        let master = ProcessInfo { pid: 10, ppid: 1, command: "nginx".into(), cmdline: vec!["nginx: master process /usr/sbin/nginx".into()] };
        let worker = ProcessInfo { pid: 11, ppid: 10, command: "nginx".into(), cmdline: vec!["nginx: worker process".into()] };
        assert!(is_master(&master));
        assert!(!is_master(&worker));
    }

    #[tokio::test]
    async fn run_once_is_a_no_op_without_a_registered_root() {
        let tank = ObjectTank::new();
        let probe: Arc<dyn Probe> = Arc::new(FakeProbe {
            processes: vec![ProcessInfo {
                pid: 100,
                ppid: 1,
                command: "nginx".into(),
                cmdline: vec!["nginx: master process /usr/sbin/nginx".into()],
            }],
        });
        let subprocess: Arc<dyn SubprocessRunner> = Arc::new(FakeRunner { calls: AtomicUsize::new(0) });
        let http: Arc<dyn HTTPClient> = Arc::new(FakeHttp);
        let config = ConfigTank::new(crate::config::ConfigSnapshot::default());
        let manager = NginxManager::new(probe, subprocess, http, config, "root-uuid".to_string(), intervals());

        manager.run_once(&tank).await;

        assert_eq!(tank.find_all_by_type(ObjectType::Nginx).len(), 0);
    }

    #[tokio::test]
    async fn unregisters_tracked_object_when_process_disappears() {
        let tank = ObjectTank::new();
        let root = tank.register(Object::new(ObjectType::System, "root-uuid".into(), "sys".into(), None, intervals()), None).unwrap();
        root.start();

        let probe: Arc<dyn Probe> = Arc::new(FakeProbe { processes: vec![] });
        let subprocess: Arc<dyn SubprocessRunner> = Arc::new(FakeRunner { calls: AtomicUsize::new(0) });
        let http: Arc<dyn HTTPClient> = Arc::new(FakeHttp);
        let config = ConfigTank::new(crate::config::ConfigSnapshot::default());
        let manager = NginxManager::new(probe, subprocess, http, config, "root-uuid".to_string(), intervals());

        let fake_object = Object::new(ObjectType::Nginx, "root-uuid".into(), "fake-local-id".into(), None, intervals());
        let registered = tank.register(fake_object, Some(root.id)).unwrap();
        manager.tracked.lock().insert("fake-local-id".to_string(), Tracked { pid: 999, object_id: registered.id });

        manager.run_once(&tank).await;

        assert!(tank.find_one(registered.id).is_none());
        assert!(manager.tracked.lock().is_empty());
    }
}
