//! Layered configuration (spec.md section 6, SPEC_FULL.md B.3): built-in defaults <
//! INI file < environment variables < cloud-pushed deltas, exposed as an immutable
//! snapshot with copy-on-write `apply()` (spec.md section 9, "Config mutation").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::errors::AgentError;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pid: PathBuf,
    pub cpu_limit: f64,
    pub cpu_sleep: Duration,
    /// SPEC_FULL.md C.3: window the CPU governor samples over, as a config key rather
    /// than an implicit fraction of `cpu_sleep`.
    pub cpu_check_window: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            pid: PathBuf::from("/var/run/amplify-agent/amplify-agent.pid"),
            cpu_limit: 10.0,
            cpu_sleep: Duration::from_secs(60),
            cpu_check_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_timeout: Duration,
    pub talk_interval: Duration,
    pub push_interval: Duration,
    /// 0 disables gzip; 1-9 select a `flate2` compression level (SPEC_FULL.md D).
    pub gzip: u32,
    pub verify_ssl_cert: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            api_url: "https://receiver.amplify.nginx.com".to_string(),
            api_timeout: Duration::from_secs(5),
            talk_interval: Duration::from_secs(10),
            push_interval: Duration::from_secs(60),
            gzip: 0,
            verify_ssl_cert: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialsConfig {
    pub api_key: String,
    pub uuid: Option<String>,
    pub hostname: Option<String>,
    pub imagename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollIntervals {
    pub meta: Duration,
    pub metrics: Duration,
    pub configs: Duration,
    pub logs: Duration,
    pub discover: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        let ten = Duration::from_secs(10);
        PollIntervals { meta: ten, metrics: ten, configs: ten, logs: ten, discover: ten }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NginxContainerConfig {
    pub parse_delay: Option<Duration>,
    pub max_test_duration: Option<Duration>,
    pub upload_config: bool,
    pub upload_ssl: bool,
    pub run_test: bool,
    pub exclude_logs: Vec<String>,
    pub poll_intervals: PollIntervals,
    /// SPEC_FULL.md C.4: `containers.<type>.launcher_allowlist`.
    pub launcher_allowlist: Vec<String>,
    /// SPEC_FULL.md D: `containers.nginx.syslog_marker`.
    pub syslog_marker: String,
}

impl NginxContainerConfig {
    fn with_defaults() -> Self {
        NginxContainerConfig {
            run_test: true,
            upload_config: true,
            syslog_marker: "amplify: ".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NginxUrlOverrides {
    pub stub_status: Option<String>,
    pub plus_status: Option<String>,
    pub api: Option<String>,
}

/// The fully resolved configuration at a point in time (spec.md section 9: "immutable
/// snapshot with copy-on-write apply").
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub daemon: DaemonConfig,
    pub cloud: CloudConfig,
    pub credentials: CredentialsConfig,
    pub nginx_container: NginxContainerConfig,
    pub nginx_urls: NginxUrlOverrides,
    pub agent_launchers: Vec<String>,
    pub tags: Vec<String>,
    /// `AMPLIFY_ENVIRONMENT`: `production` (default), `development`, or `sandbox`
    /// (spec.md section 6). Selects `cloud.api_url`'s default when the INI file doesn't
    /// set one explicitly; otherwise carried only for display/meta purposes.
    pub environment: String,
    /// Any key this snapshot doesn't model explicitly (unrecognized sections), kept
    /// around so a cloud patch referencing them doesn't silently vanish.
    pub raw: BTreeMap<String, Value>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            daemon: DaemonConfig::default(),
            cloud: CloudConfig::default(),
            credentials: CredentialsConfig::default(),
            nginx_container: NginxContainerConfig::with_defaults(),
            nginx_urls: NginxUrlOverrides::default(),
            agent_launchers: Vec::new(),
            tags: Vec::new(),
            environment: "production".to_string(),
            raw: BTreeMap::new(),
        }
    }
}

/// The cloud endpoint a profile points at when the operator hasn't set `cloud.api_url`
/// explicitly (spec.md section 6: `AMPLIFY_ENVIRONMENT` "selects a config profile").
/// `production` has no override -- `CloudConfig::default()`'s receiver is already the
/// production endpoint.
fn profile_default_api_url(profile: &str) -> Option<&'static str> {
    match profile {
        "sandbox" => Some("https://sandbox-receiver.amplify.nginx.com"),
        "development" => Some("http://localhost:8000"),
        _ => None,
    }
}

impl ConfigSnapshot {
    /// Fails startup (spec.md section 7, "Configuration-surface" errors) when mandatory
    /// identity fields are missing.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.credentials.api_key.is_empty() {
            return Err(AgentError::ConfigInvalid("credentials.api_key is required".to_string()));
        }
        if self.cloud.api_url.is_empty() {
            return Err(AgentError::ConfigInvalid("cloud.api_url is required".to_string()));
        }
        Ok(())
    }

    /// Applies a cloud-pushed config delta (spec.md section 4.8, section 9). Only keys
    /// this snapshot models are merged structurally; anything else lands in `raw`.
    /// Returns the new snapshot and how many top-level keys changed.
    pub fn apply(&self, patch: &Value) -> (ConfigSnapshot, usize) {
        let mut next = self.clone();
        let mut changed = 0usize;

        let Some(obj) = patch.as_object() else {
            return (next, 0);
        };

        for (key, value) in obj {
            let before = serde_json::to_value(&next.raw.get(key)).ok();
            match key.as_str() {
                "cloud.gzip" => {
                    if let Some(level) = value.as_u64() {
                        if next.cloud.gzip != level as u32 {
                            next.cloud.gzip = level as u32;
                            changed += 1;
                        }
                        continue;
                    }
                }
                "cloud.push_interval" => {
                    if let Some(secs) = value.as_u64() {
                        let dur = Duration::from_secs(secs);
                        if next.cloud.push_interval != dur {
                            next.cloud.push_interval = dur;
                            changed += 1;
                        }
                        continue;
                    }
                }
                "daemon.cpu_limit" => {
                    if let Some(pct) = value.as_f64() {
                        if (next.daemon.cpu_limit - pct).abs() > f64::EPSILON {
                            next.daemon.cpu_limit = pct;
                            changed += 1;
                        }
                        continue;
                    }
                }
                "credentials.uuid" => {
                    if let Some(uuid) = value.as_str() {
                        if next.credentials.uuid.as_deref() != Some(uuid) {
                            next.credentials.uuid = Some(uuid.to_string());
                            changed += 1;
                        }
                        continue;
                    }
                }
                _ => {}
            }

            let after = Some(value.clone());
            if before != after {
                next.raw.insert(key.clone(), value.clone());
                changed += 1;
            }
        }

        (next, changed)
    }
}

/// Process-wide config handle; an `Arc<ConfigSnapshot>` swapped on cloud patches
/// (spec.md section 9, "Global singletons" -> explicit handle rather than a singleton).
#[derive(Clone)]
pub struct ConfigTank {
    current: Arc<parking_lot::RwLock<Arc<ConfigSnapshot>>>,
}

impl ConfigTank {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        ConfigTank {
            current: Arc::new(parking_lot::RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Atomically installs a patched snapshot, returning the changed-key count
    /// (spec.md section 9: "apply(patch) returns a new snapshot and a change-count").
    pub fn apply(&self, patch: &Value) -> usize {
        let current = self.snapshot();
        let (next, changed) = current.apply(patch);
        *self.current.write() = Arc::new(next);
        changed
    }
}

/// Reads an INI-like file into a flat `section.key -> value` map (spec.md section 6).
/// Lines starting with `#` or `;` are comments; blank lines are skipped; `[section]`
/// headers switch the active section; `key = value` pairs are trimmed.
pub fn read_ini_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    Ok(parse_ini(&contents))
}

pub fn parse_ini(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut section = String::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_string();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').to_string();
        let full_key = if section.is_empty() { key.to_string() } else { format!("{section}.{key}") };
        out.insert(full_key, value);
    }

    out
}

/// Builds a `ConfigSnapshot` from defaults overlaid with an INI map, then environment
/// variables (spec.md section 6: `AMPLIFY_ENVIRONMENT`, `AMPLIFY_IMAGENAME`).
pub fn build_snapshot(ini: &BTreeMap<String, String>, env: &BTreeMap<String, String>) -> ConfigSnapshot {
    let mut snap = ConfigSnapshot::default();

    if let Some(v) = ini.get("daemon.pid") {
        snap.daemon.pid = PathBuf::from(v);
    }
    if let Some(v) = ini.get("daemon.cpu_limit").and_then(|s| s.parse().ok()) {
        snap.daemon.cpu_limit = v;
    }
    if let Some(v) = ini.get("daemon.cpu_sleep").and_then(|s| s.parse().ok()) {
        snap.daemon.cpu_sleep = Duration::from_secs_f64(v);
    }
    if let Some(v) = ini.get("daemon.cpu_check_window").and_then(|s| s.parse().ok()) {
        snap.daemon.cpu_check_window = Duration::from_secs_f64(v);
    } else {
        snap.daemon.cpu_check_window = snap.daemon.cpu_sleep;
    }

    if let Some(v) = ini.get("cloud.api_url") {
        snap.cloud.api_url = v.clone();
    }
    if let Some(v) = ini.get("cloud.api_timeout").and_then(|s| s.parse().ok()) {
        snap.cloud.api_timeout = Duration::from_secs_f64(v);
    }
    if let Some(v) = ini.get("cloud.talk_interval").and_then(|s| s.parse().ok()) {
        snap.cloud.talk_interval = Duration::from_secs_f64(v);
    }
    if let Some(v) = ini.get("cloud.push_interval").and_then(|s| s.parse().ok()) {
        snap.cloud.push_interval = Duration::from_secs_f64(v);
    }
    if let Some(v) = ini.get("cloud.gzip").and_then(|s| s.parse().ok()) {
        snap.cloud.gzip = v;
    }
    if let Some(v) = ini.get("cloud.verify_ssl_cert").and_then(|s| s.parse().ok()) {
        snap.cloud.verify_ssl_cert = v;
    }

    if let Some(v) = ini.get("credentials.api_key") {
        snap.credentials.api_key = v.clone();
    }
    if let Some(v) = ini.get("credentials.uuid") {
        snap.credentials.uuid = Some(v.clone());
    }
    if let Some(v) = ini.get("credentials.hostname") {
        snap.credentials.hostname = Some(v.clone());
    }
    if let Some(v) = ini.get("credentials.imagename") {
        snap.credentials.imagename = Some(v.clone());
    }

    if let Some(v) = ini.get("containers.nginx.run_test") {
        snap.nginx_container.run_test = v == "true" || v == "1";
    }
    if let Some(v) = ini.get("containers.nginx.upload_config") {
        snap.nginx_container.upload_config = v == "true" || v == "1";
    }
    if let Some(v) = ini.get("containers.nginx.upload_ssl") {
        snap.nginx_container.upload_ssl = v == "true" || v == "1";
    }
    if let Some(v) = ini.get("containers.nginx.syslog_marker") {
        snap.nginx_container.syslog_marker = v.clone();
    }
    if let Some(v) = ini.get("containers.nginx.exclude_logs") {
        snap.nginx_container.exclude_logs = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = ini.get("containers.nginx.launcher_allowlist") {
        snap.nginx_container.launcher_allowlist = v.split(',').map(|s| s.trim().to_string()).collect();
    }

    snap.nginx_urls.stub_status = ini.get("nginx.stub_status").cloned();
    snap.nginx_urls.plus_status = ini.get("nginx.plus_status").cloned();
    snap.nginx_urls.api = ini.get("nginx.api").cloned();

    if let Some(v) = ini.get("agent.launchers") {
        snap.agent_launchers = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(v) = ini.get("tags.tags") {
        snap.tags = v.split(',').map(|s| s.trim().to_string()).collect();
    }

    if let Some(image) = env.get("AMPLIFY_IMAGENAME") {
        if snap.credentials.imagename.is_none() {
            snap.credentials.imagename = Some(image.clone());
        }
    }

    if let Some(profile) = env.get("AMPLIFY_ENVIRONMENT") {
        snap.environment = profile.clone();
        if ini.get("cloud.api_url").is_none() {
            if let Some(default_url) = profile_default_api_url(profile) {
                snap.cloud.api_url = default_url.to_string();
            }
        }
    }

    snap
}
