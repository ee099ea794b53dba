//! `PlusCache` and the stub_status / Plus API extractors (spec.md section 4.5, section 6).

use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// `stub_status` response shape (spec.md section 6):
/// ```text
/// Active connections: <n>
///  <accepts> <handled> <requests>
///  Reading: <r> Writing: <w> Waiting: <waiting>
/// ```
static STUB_STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        Active\ connections:\s*(?P<connections>\d+)\s*
        \D*(?P<accepts>\d+)\s+(?P<handled>\d+)\s+(?P<requests>\d+)\s*
        Reading:\s*(?P<reading>\d+)\s+
        Writing:\s*(?P<writing>\d+)\s+
        Waiting:\s*(?P<waiting>\d+)
        ",
    )
    .expect("static stub_status regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubStatus {
    pub connections: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

impl StubStatus {
    /// `dropped = accepts - handled`, `current = connections`,
    /// `active = connections - waiting`, `idle = waiting` (spec.md section 6).
    pub fn dropped(&self) -> u64 {
        self.accepts.saturating_sub(self.handled)
    }

    pub fn active(&self) -> u64 {
        self.connections.saturating_sub(self.waiting)
    }
}

pub fn parse_stub_status(body: &str) -> Option<StubStatus> {
    let caps = STUB_STATUS_RE.captures(body)?;
    let field = |name: &str| caps.name(name)?.as_str().parse::<u64>().ok();
    Some(StubStatus {
        connections: field("connections")?,
        accepts: field("accepts")?,
        handled: field("handled")?,
        requests: field("requests")?,
        reading: field("reading")?,
        writing: field("writing")?,
        waiting: field("waiting")?,
    })
}

/// Heuristic for whether a `location` block is a Plus API dashboard rather than a raw
/// API endpoint (spec.md section 4.5, section 9 Design Notes/Open Questions).
///
/// SPEC_FULL.md D strengthens the original root-path + `dashboard.html` suffix check
/// with an explicit `status_zone` directive check when one is present, rather than
/// relying on the path heuristic alone.
pub fn looks_like_plus_dashboard(location_path: &str, status_zone: Option<&str>) -> bool {
    if let Some(zone) = status_zone {
        return !zone.is_empty();
    }
    location_path == "/" || location_path.ends_with("dashboard.html")
}

/// Key-value cache of recent Plus status payloads, bounded to the last 3 per URL
/// (spec.md section 4.5; grounded on the original `PlusCache`'s `deque(maxlen=3)`).
#[derive(Default)]
pub struct PlusCache {
    caches: DashMap<String, Vec<(Value, i64)>>,
}

const MAX_CACHE_LEN: usize = 3;

impl PlusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, url: &str, data: Value, timestamp: i64) {
        let mut entry = self.caches.entry(url.to_string()).or_default();
        entry.push((data, timestamp));
        if entry.len() > MAX_CACHE_LEN {
            let overflow = entry.len() - MAX_CACHE_LEN;
            entry.drain(0..overflow);
        }
    }

    pub fn get_last(&self, url: &str) -> Option<(Value, i64)> {
        self.caches.get(url)?.last().cloned()
    }

    pub fn history(&self, url: &str) -> Vec<(Value, i64)> {
        self.caches.get(url).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn remove(&self, url: &str) {
        self.caches.remove(url);
    }
}

/// Named JSON-pointer-style field extractors for the Plus API response (spec.md section
/// 4.5: "Extractor" capability interface, section 9 "Regex-driven extractors... keep as
/// named constants").
pub type ExtractorFn = fn(&Value) -> Option<Value>;

pub fn extractor_registry() -> HashMap<&'static str, ExtractorFn> {
    let mut m: HashMap<&'static str, ExtractorFn> = HashMap::new();
    m.insert("connections.active", |v| v.pointer("/connections/active").cloned());
    m.insert("connections.dropped", |v| v.pointer("/connections/dropped").cloned());
    m.insert("requests.total", |v| v.pointer("/requests/total").cloned());
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s1_stub_status_scenario() {
        let body = "Active connections: 291 \n server accepts handled requests\n 16630948 16630948 31070465 \n Reading: 6 Writing: 179 Waiting: 106\n";
        let parsed = parse_stub_status(body).unwrap();
        assert_eq!(parsed.connections, 291);
        assert_eq!(parsed.accepts, 16630948);
        assert_eq!(parsed.handled, 16630948);
        assert_eq!(parsed.requests, 31070465);
        assert_eq!(parsed.reading, 6);
        assert_eq!(parsed.writing, 179);
        assert_eq!(parsed.waiting, 106);
        assert_eq!(parsed.dropped(), 0);
        assert_eq!(parsed.active(), 185);
    }

    #[test]
    fn malformed_body_returns_none() {
        assert!(parse_stub_status("not a stub status body").is_none());
    }

    #[test]
    fn plus_dashboard_heuristic_prefers_status_zone_when_present() {
        assert!(looks_like_plus_dashboard("/anything", Some("zone-1")));
        assert!(!looks_like_plus_dashboard("/anything", Some("")));
        assert!(looks_like_plus_dashboard("/", None));
        assert!(looks_like_plus_dashboard("/status/dashboard.html", None));
        assert!(!looks_like_plus_dashboard("/api/7", None));
    }

    #[test]
    fn plus_cache_bounds_to_three_entries() {
        let cache = PlusCache::new();
        for i in 0..5 {
            cache.put("http://localhost/plus_status", serde_json::json!({"n": i}), 1000 + i);
        }
        let history = cache.history("http://localhost/plus_status");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].1, 1002);
        assert_eq!(history[2].1, 1004);
    }

    #[test]
    fn get_last_returns_most_recent() {
        let cache = PlusCache::new();
        cache.put("u", serde_json::json!({"a": 1}), 10);
        cache.put("u", serde_json::json!({"a": 2}), 20);
        let (value, ts) = cache.get_last("u").unwrap();
        assert_eq!(ts, 20);
        assert_eq!(value["a"], 2);
    }

    #[test]
    fn get_last_is_none_for_unknown_url() {
        let cache = PlusCache::new();
        assert!(cache.get_last("missing").is_none());
    }
}
