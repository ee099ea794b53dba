//! The Supervisor (spec.md section 4.8): boot handshake, manager init order, the 5s main
//! loop, the CPU governor, and cloud-config diff application.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::Bridge;
use crate::clock::CancelToken;
use crate::config::ConfigTank;
use crate::errors::AgentError;
use crate::httpclient::{agent_url, AgentHandshakeResponse, HTTPClient};
use crate::manager::AbstractManager;
use crate::probe::Probe;
use crate::tank::ObjectTank;
use crate::version::{Version, VersionPolicy, VersionStatus};

const MAIN_LOOP_INTERVAL: Duration = Duration::from_secs(5);

/// One named manager plus the join handle of its running task, so the main loop can
/// detect a crash and respawn it (spec.md section 4.8: "Manage external manager workers
/// (respawn on crash)").
struct ManagerSlot {
    name: &'static str,
    manager: Arc<dyn AbstractManager>,
    handle: Option<JoinHandle<()>>,
}

/// Orchestrates the boot handshake, manager lifecycle, and periodic cloud talk
/// (spec.md section 4.8).
pub struct Supervisor {
    tank: Arc<ObjectTank>,
    http: Arc<dyn HTTPClient>,
    config: ConfigTank,
    probe: Arc<dyn Probe>,
    bridge: Arc<Bridge>,
    managers: Vec<ManagerSlot>,
    cancel: CancelToken,
    action_id: AtomicU64,
    cloud_talk_last: std::sync::Mutex<Instant>,
    cloud_talk_delay: std::sync::Mutex<Duration>,
    /// Persists a cloud-assigned UUID on first handshake (SPEC_FULL.md C.2). `None` in
    /// tests and anywhere on-host persistence isn't wanted.
    uuid_sink: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

/// `DEFAULT_LAUNCHERS` order per spec.md section 4.8: `[system, nginx, status, api]`,
/// extension managers are appended after by the caller.
pub const BUILTIN_MANAGER_ORDER: &[&str] = &["system", "nginx", "status", "api"];

impl Supervisor {
    pub fn new(
        tank: Arc<ObjectTank>,
        http: Arc<dyn HTTPClient>,
        config: ConfigTank,
        probe: Arc<dyn Probe>,
        managers: Vec<(&'static str, Arc<dyn AbstractManager>)>,
    ) -> Self {
        let bridge = Bridge::new(tank.clone(), http.clone(), config.clone());
        let now = Instant::now();
        Supervisor {
            tank,
            http,
            config,
            probe,
            bridge,
            managers: managers
                .into_iter()
                .map(|(name, manager)| ManagerSlot { name, manager, handle: None })
                .collect(),
            cancel: CancelToken::new(),
            action_id: AtomicU64::new(0),
            cloud_talk_last: std::sync::Mutex::new(now),
            cloud_talk_delay: std::sync::Mutex::new(Duration::ZERO),
            uuid_sink: None,
        }
    }

    /// Installs the callback used to persist a cloud-assigned UUID on first handshake
    /// (SPEC_FULL.md C.2).
    pub fn with_uuid_sink(mut self, sink: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.uuid_sink = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the boot sequence then the main loop until cancelled (spec.md section 4.8).
    pub async fn run(mut self) -> Result<(), AgentError> {
        self.boot().await?;
        self.spawn_managers();
        let bridge = self.bridge.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { bridge.run(cancel).await });

        loop {
            if !self.cancel.sleep(MAIN_LOOP_INTERVAL).await {
                break;
            }
            self.main_loop_tick().await;
        }
        Ok(())
    }

    /// Steps 1-3 of spec.md section 4.8's boot sequence; step 4 (spawning the Bridge) is
    /// done by `run()` after this returns so tests can call `boot()` in isolation.
    async fn boot(&mut self) -> Result<(), AgentError> {
        let handshake = self.talk_to_cloud(true).await;
        let Some(handshake) = handshake else {
            // Transient failure on the very first handshake is not fatal; the main loop
            // retries at `talk_interval` cadence.
            warn!("initial handshake failed; continuing, will retry on main loop cadence");
            return Ok(());
        };

        let policy = VersionPolicy {
            current: Version::parse(&handshake.versions.current).unwrap_or(Version::current()),
            obsolete: Version::parse(&handshake.versions.obsolete).unwrap_or(Version::new(0, 0, 0)),
            old: Version::parse(&handshake.versions.old).unwrap_or(Version::new(0, 0, 0)),
        };
        match policy.status(Version::current()) {
            VersionStatus::Obsolete => {
                return Err(AgentError::ObsoleteVersion(handshake.versions.obsolete.clone()));
            }
            VersionStatus::Old => {
                warn!(running = %Version::current(), current = %handshake.versions.current, "agent version is old, consider upgrading");
            }
            VersionStatus::Current => {}
        }

        self.config.apply(&handshake.config);

        if self.config.snapshot().credentials.uuid.is_none() {
            if let Some(uuid) = &handshake.uuid {
                self.config.apply(&json!({"credentials.uuid": uuid}));
                if let Some(sink) = &self.uuid_sink {
                    sink(uuid);
                }
            }
        }
        Ok(())
    }

    fn spawn_managers(&mut self) {
        for slot in &mut self.managers {
            let manager = slot.manager.clone();
            let tank = self.tank.clone();
            let cancel = self.cancel.clone();
            slot.handle = Some(tokio::spawn(async move { manager.run(tank, cancel).await }));
            info!(manager = slot.name, "manager started");
        }
    }

    /// One 5s main-loop tick (spec.md section 4.8).
    async fn main_loop_tick(&mut self) {
        self.check_cpu_governor().await;
        self.action_id.fetch_add(1, Ordering::SeqCst);

        if self.root_definition_healthy() {
            self.maybe_talk_to_cloud().await;
        }

        self.respawn_dead_managers();
    }

    fn root_definition_healthy(&self) -> bool {
        self.tank
            .root_id()
            .and_then(|id| self.tank.find_one(id))
            .map(|obj| obj.definition_healthy())
            .unwrap_or(false)
    }

    /// Advisory CPU governor (spec.md section 5: "before each action-id increment, check
    /// process CPU use over a short window; if greater than cpu_limit, sleep cpu_sleep").
    async fn check_cpu_governor(&self) {
        let snapshot = self.config.snapshot();
        let window = snapshot.daemon.cpu_check_window;
        let Ok(cpu_pct) = self.probe.own_cpu_percent(window).await else {
            return;
        };
        if cpu_pct > snapshot.daemon.cpu_limit {
            warn!(cpu_pct, limit = snapshot.daemon.cpu_limit, "agent CPU over limit, sleeping");
            self.cancel.sleep(snapshot.daemon.cpu_sleep).await;
        }
    }

    fn respawn_dead_managers(&mut self) {
        for slot in &mut self.managers {
            let dead = match &slot.handle {
                Some(h) => h.is_finished(),
                None => true,
            };
            if dead {
                warn!(manager = slot.name, "manager task exited, respawning");
                let manager = slot.manager.clone();
                let tank = self.tank.clone();
                let cancel = self.cancel.clone();
                slot.handle = Some(tokio::spawn(async move { manager.run(tank, cancel).await }));
            }
        }
    }

    async fn maybe_talk_to_cloud(&self) {
        let snapshot = self.config.snapshot();
        let delay = *self.cloud_talk_delay.lock().unwrap();
        let due = {
            let last = *self.cloud_talk_last.lock().unwrap();
            Instant::now() >= last + snapshot.cloud.talk_interval + delay
        };
        if !due {
            return;
        }
        *self.cloud_talk_last.lock().unwrap() = Instant::now();

        if let Some(handshake) = self.talk_to_cloud(false).await {
            let changed = self.config.apply(&handshake.config);
            if changed > 0 {
                self.apply_global_config_diff().await;
            }
            *self.cloud_talk_delay.lock().unwrap() = Duration::ZERO;
        } else {
            let mut delay = self.cloud_talk_delay.lock().unwrap();
            *delay = next_backoff(*delay);
        }
    }

    /// Handshake POST to `{api_url}/{api_key}/agent/` (spec.md section 6, 4.8).
    async fn talk_to_cloud(&self, initial: bool) -> Option<AgentHandshakeResponse> {
        let snapshot = self.config.snapshot();
        let url = agent_url(&snapshot.cloud.api_url, &snapshot.credentials.api_key);
        let root_definition = self
            .tank
            .root_id()
            .and_then(|id| self.tank.find_one(id))
            .map(|obj| obj.definition());

        let body = json!({
            "initial": initial,
            "definition": root_definition,
        });
        let payload = serde_json::to_vec(&body).ok()?;

        match self.http.post_json(&url, &payload, snapshot.cloud.gzip > 0).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                serde_json::from_slice::<AgentHandshakeResponse>(&resp.body).ok()
            }
            Ok(resp) => {
                warn!(status = resp.status, "cloud handshake rejected");
                None
            }
            Err(e) => {
                error!(error = %e, "cloud handshake failed");
                None
            }
        }
    }

    /// spec.md section 4.8, "Cloud-config application": flush once, stop managers in
    /// reverse order, re-init. Manager re-instantiation from the new config is left to
    /// the caller owning the `Arc<dyn AbstractManager>` instances (this only handles the
    /// teardown half, which is process-generic).
    async fn apply_global_config_diff(&mut self) {
        info!("applying global config diff: flushing and restarting managers");
        self.bridge.force().await;

        for slot in self.managers.iter_mut().rev() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        self.tank.begin_teardown();
        if let Some(root_id) = self.tank.root_id() {
            self.tank.unregister(root_id).await;
        }
        self.tank.end_teardown();

        self.spawn_managers();
    }
}

/// Mirrors the Bridge's exponential backoff shape for the cloud-talk retry cadence
/// (spec.md section 4.8: "same backoff/backpressure rules as the Bridge").
fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        Duration::from_secs(15)
    } else {
        (current * 2).min(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::httpclient::HttpResponse;
    use crate::probe::FakeProbe;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    struct FakeHttp {
        handshake_body: Value,
    }

    #[async_trait]
    impl HTTPClient for FakeHttp {
        async fn post_json(&self, _url: &str, _body: &[u8], _gzip: bool) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse { status: 200, body: serde_json::to_vec(&self.handshake_body)? })
        }
        async fn get(&self, _url: &str, _timeout: Duration) -> anyhow::Result<HttpResponse> {
            unimplemented!()
        }
    }

    struct NoopManager {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AbstractManager for NoopManager {
        fn interval(&self) -> Duration {
            Duration::from_millis(1)
        }
        async fn run_once(&self, _tank: &ObjectTank) {
            self.ran.store(true, Ordering::SeqCst);
        }
    }

    fn config_tank() -> ConfigTank {
        let mut snap = ConfigSnapshot::default();
        snap.credentials.api_key = "key1".to_string();
        ConfigTank::new(snap)
    }

    #[tokio::test]
    async fn boot_applies_handshake_config_and_accepts_current_version() {
        let tank = Arc::new(ObjectTank::new());
        let handshake = json!({
            "config": {"cloud.gzip": 5},
            "objects": [],
            "versions": {"current": "2.0.0", "obsolete": "0.1.0", "old": "1.0.0"},
            "capabilities": {},
            "messages": []
        });
        let http = Arc::new(FakeHttp { handshake_body: handshake });
        let config = config_tank();
        let probe: Arc<dyn Probe> = Arc::new(FakeProbe { processes: vec![], memory: HashMap::new() });

        let mut supervisor = Supervisor::new(tank, http, config.clone(), probe, vec![]);
        supervisor.boot().await.unwrap();

        assert_eq!(config.snapshot().cloud.gzip, 5);
    }

    #[tokio::test]
    async fn boot_fails_fast_on_obsolete_version() {
        let tank = Arc::new(ObjectTank::new());
        let handshake = json!({
            "config": {},
            "objects": [],
            "versions": {"current": "9.0.0", "obsolete": "9.0.0", "old": "9.0.0"},
            "capabilities": {},
            "messages": []
        });
        let http = Arc::new(FakeHttp { handshake_body: handshake });
        let probe: Arc<dyn Probe> = Arc::new(FakeProbe { processes: vec![], memory: HashMap::new() });

        let mut supervisor = Supervisor::new(tank, http, config_tank(), probe, vec![]);
        let result = supervisor.boot().await;
        assert!(matches!(result, Err(AgentError::ObsoleteVersion(_))));
    }

    #[test]
    fn backoff_doubles_and_caps_at_one_hour() {
        let mut delay = Duration::ZERO;
        for _ in 0..20 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, Duration::from_secs(3600));
    }
}
