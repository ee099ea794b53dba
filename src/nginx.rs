//! NGINX core coordination (spec.md section 4.5): `nginx -V` parsing, the config
//! coordinator's parse gate and checksum, and endpoint discovery/version gating for
//! stub_status/Plus status/API.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::configparser::{FileMeta, ParsedConfig};
use crate::httpclient::HTTPClient;
use crate::plus::looks_like_plus_dashboard;

/// Parsed `nginx -V` output (spec.md section 4.5: `(... version, parsed_v)`; grounded on
/// the original `nginx_v()`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NginxBuildInfo {
    pub version: Option<String>,
    pub plus_enabled: bool,
    pub plus_release: Option<String>,
    pub configure_arguments: BTreeMap<String, String>,
}

static VERSION_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/([\d\w.]+)").unwrap());
static PLUS_RELEASE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(([\w-]+)\)").unwrap());

/// Parses the stderr of `nginx -V` (that's where NGINX writes it).
pub fn parse_nginx_v_output(stderr: &str) -> NginxBuildInfo {
    let mut info = NginxBuildInfo::default();

    for line in stderr.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "nginx version" {
            info.version = VERSION_LINE_RE
                .captures(value)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .or_else(|| Some(value.to_string()));

            if value.contains("plus") {
                info.plus_enabled = true;
                info.plus_release = PLUS_RELEASE_RE.captures(value).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
            }
        } else if key == "configure arguments" {
            info.configure_arguments = parse_configure_arguments(value);
        }
    }

    info
}

fn parse_configure_arguments(value: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for arg in value.split("--").skip(1) {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        match arg.split_once('=') {
            Some((k, v)) => {
                out.insert(k.trim().to_string(), v.trim().trim_end_matches(' ').to_string());
            }
            None => {
                out.insert(arg.trim_end_matches(' ').to_string(), String::new());
            }
        }
    }
    out
}

/// Extracts the trailing numeric release from a Plus release string like `"r15"`.
fn plus_release_number(release: &str) -> Option<u32> {
    release.trim_start_matches('r').parse().ok()
}

/// The `status` directive is only considered supported for Plus releases with `r <= 15`;
/// otherwise the Plus API path is the only first-class metrics source (spec.md section
/// 4.5: "Version gating").
pub fn status_directive_supported(build: &NginxBuildInfo) -> bool {
    match (&build.plus_enabled, &build.plus_release) {
        (false, _) => true,
        (true, Some(release)) => plus_release_number(release).is_some_and(|r| r <= 15),
        (true, None) => false,
    }
}

/// Tracks the config-parse throttle state (spec.md section 4.5: "Config collector parse
/// gate").
#[derive(Debug, Clone)]
pub struct ConfigCoordinator {
    wait_until: i64,
    last_fingerprint: Option<Vec<FileMeta>>,
    last_checksum: Option<String>,
    parse_delay_default: Duration,
}

impl ConfigCoordinator {
    pub fn new(parse_delay_default: Duration) -> Self {
        ConfigCoordinator {
            wait_until: 0,
            last_fingerprint: None,
            last_checksum: None,
            parse_delay_default,
        }
    }

    /// Skip parse unless `now >= wait_until`, unless `no_delay` overrides the throttle.
    pub fn should_parse(&self, now: i64, no_delay: bool) -> bool {
        no_delay || now >= self.wait_until
    }

    /// True if the lightweight fingerprint (paths + mtimes + permissions) differs from
    /// the last successful parse's fingerprint.
    pub fn fingerprint_changed(&self, new_fingerprint: &[FileMeta]) -> bool {
        self.last_fingerprint.as_deref() != Some(new_fingerprint)
    }

    /// Adaptive throttle: `wait_until = parse_start + max(2 * parse_duration,
    /// parse_delay_default)`.
    pub fn record_parse(&mut self, parse_start: i64, parse_duration: Duration, fingerprint: Vec<FileMeta>) {
        let throttle = (parse_duration * 2).max(self.parse_delay_default);
        self.wait_until = parse_start + throttle.as_secs() as i64;
        self.last_fingerprint = Some(fingerprint);
    }

    pub fn last_checksum(&self) -> Option<&str> {
        self.last_checksum.as_deref()
    }

    /// Checksum over every config file's content hash, permissions, and mtime, plus
    /// directory metadata and (if provided) SSL file contents (spec.md section 4.5:
    /// "compute checksum over (file SHA-256 || permissions || mtime)").
    pub fn compute_checksum(files: &[(FileMeta, Vec<u8>)], ssl_files: &[Vec<u8>]) -> String {
        let mut hasher = Sha256::new();
        let mut sorted: Vec<_> = files.iter().collect();
        sorted.sort_by(|a, b| a.0.path.cmp(&b.0.path));

        for (meta, contents) in sorted {
            let mut file_hasher = Sha256::new();
            file_hasher.update(contents);
            let file_hash = hex::encode(file_hasher.finalize());
            hasher.update(file_hash.as_bytes());
            hasher.update(meta.permissions_mode.to_le_bytes());
            hasher.update(meta.mtime_secs.to_le_bytes());
        }

        for ssl in ssl_files {
            hasher.update(ssl);
        }

        hex::encode(hasher.finalize())
    }

    /// Returns `true` (and remembers the checksum) if `checksum` differs from the last
    /// one recorded -- the `upload_config` gate (spec.md section 4.5).
    pub fn checksum_changed(&mut self, checksum: String) -> bool {
        let changed = self.last_checksum.as_deref() != Some(checksum.as_str());
        self.last_checksum = Some(checksum);
        changed
    }
}

/// Per-class external/internal url candidates (spec.md section 4.5: "external (using
/// server_name) and internal (using listen IP)").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointUrls {
    pub external: Vec<String>,
    pub internal: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredEndpoints {
    pub stub_status: EndpointUrls,
    pub plus_status: EndpointUrls,
    pub api: EndpointUrls,
}

/// Walks `server{}` blocks and their `location{}` children, classifying each by its
/// distinguishing directive (spec.md section 4.5: "Endpoint discovery").
pub fn discover_endpoints(parsed: &ParsedConfig, status_directive_allowed: bool) -> DiscoveredEndpoints {
    let mut out = DiscoveredEndpoints::default();

    for server in &parsed.servers {
        for location in &server.locations {
            let (target, path) = if location.directives.contains_key("stub_status") {
                (&mut out.stub_status, &location.path)
            } else if location.directives.contains_key("api") {
                (&mut out.api, &location.path)
            } else if status_directive_allowed && location.directives.contains_key("status") {
                (&mut out.plus_status, &location.path)
            } else if looks_like_plus_dashboard(&location.path, location.directives.get("status_zone").map(|s| s.as_str())) {
                (&mut out.plus_status, &location.path)
            } else {
                continue;
            };

            for listen in &server.listens {
                target.internal.push(format!("http://{}:{}{}", listen.address, listen.port, path));
            }
            for name in &server.server_names {
                if let Some(listen) = server.listens.first() {
                    target.external.push(format!("http://{}:{}{}", name, listen.port, path));
                }
            }
        }
    }

    out
}

/// Probes `urls` (already built as `http://` candidates) trying an `https://` variant
/// too, adopting the first 2xx response that looks right per `validator` (spec.md
/// section 4.5: "try both http:// and https:// variants with a 0.5s timeout").
pub async fn probe_first_alive(client: &dyn HTTPClient, urls: &[String], timeout: Duration, validator: impl Fn(&str) -> bool) -> Option<String> {
    for url in urls {
        for candidate in [url.clone(), url.replacen("http://", "https://", 1)] {
            if let Ok(resp) = client.get(&candidate, timeout).await {
                if (200..300).contains(&resp.status) && validator(&resp.text()) {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oss_version_line() {
        let stderr = "nginx version: nginx/1.25.3\nbuilt by gcc\n";
        let build = parse_nginx_v_output(stderr);
        assert_eq!(build.version.as_deref(), Some("1.25.3"));
        assert!(!build.plus_enabled);
    }

    #[test]
    fn parses_plus_version_and_release() {
        let stderr = "nginx version: nginx/1.25.3 (nginx-plus-r31)\n";
        let build = parse_nginx_v_output(stderr);
        assert!(build.plus_enabled);
        assert_eq!(build.plus_release.as_deref(), Some("nginx-plus-r31"));
    }

    #[test]
    fn parses_configure_arguments() {
        let stderr = "configure arguments: --prefix=/etc/nginx --with-http_ssl_module --user=nginx\n";
        let build = parse_nginx_v_output(stderr);
        assert_eq!(build.configure_arguments.get("prefix"), Some(&"/etc/nginx".to_string()));
        assert!(build.configure_arguments.contains_key("with-http_ssl_module"));
    }

    #[test]
    fn status_directive_supported_for_oss_and_old_plus_releases() {
        let oss = NginxBuildInfo::default();
        assert!(status_directive_supported(&oss));

        let old_plus = NginxBuildInfo { plus_enabled: true, plus_release: Some("r15".to_string()), ..Default::default() };
        assert!(status_directive_supported(&old_plus));

        let new_plus = NginxBuildInfo { plus_enabled: true, plus_release: Some("r31".to_string()), ..Default::default() };
        assert!(!status_directive_supported(&new_plus));
    }

    #[test]
    fn parse_gate_respects_wait_until_unless_no_delay() {
        let mut gate = ConfigCoordinator::new(Duration::from_secs(60));
        gate.record_parse(1000, Duration::from_secs(1), vec![]);
        assert!(!gate.should_parse(1030, false));
        assert!(gate.should_parse(1061, false));
        assert!(gate.should_parse(1030, true));
    }

    #[test]
    fn fingerprint_change_triggers_reparse() {
        let gate = ConfigCoordinator::new(Duration::from_secs(60));
        let fp = vec![FileMeta { path: "/etc/nginx/nginx.conf".into(), mtime_secs: 1, permissions_mode: 0o644, len: 10 }];
        assert!(gate.fingerprint_changed(&fp));
    }

    #[test]
    fn checksum_changed_detects_content_diff() {
        let mut gate = ConfigCoordinator::new(Duration::from_secs(60));
        let meta = FileMeta { path: "/etc/nginx/nginx.conf".into(), mtime_secs: 1, permissions_mode: 0o644, len: 3 };
        let sum1 = ConfigCoordinator::compute_checksum(&[(meta.clone(), b"abc".to_vec())], &[]);
        assert!(gate.checksum_changed(sum1.clone()));
        assert!(!gate.checksum_changed(sum1));
        let sum2 = ConfigCoordinator::compute_checksum(&[(meta, b"xyz".to_vec())], &[]);
        assert!(gate.checksum_changed(sum2));
    }

    #[test]
    fn discover_endpoints_classifies_stub_status_and_api_locations() {
        use crate::configparser::{Listen, Location, ServerBlock};
        let mut parsed = ParsedConfig::default();
        let mut server = ServerBlock::default();
        server.listens.push(Listen { address: "127.0.0.1".to_string(), port: 80, ipv6: false });
        server.server_names.push("example.com".to_string());
        server.locations.push(Location {
            path: "/basic_status".to_string(),
            directives: [("stub_status".to_string(), "on".to_string())].into_iter().collect(),
        });
        server.locations.push(Location {
            path: "/api".to_string(),
            directives: [("api".to_string(), "".to_string())].into_iter().collect(),
        });
        parsed.servers.push(server);

        let discovered = discover_endpoints(&parsed, true);
        assert_eq!(discovered.stub_status.internal, vec!["http://127.0.0.1:80/basic_status"]);
        assert_eq!(discovered.stub_status.external, vec!["http://example.com:80/basic_status"]);
        assert_eq!(discovered.api.internal, vec!["http://127.0.0.1:80/api"]);
    }
}
