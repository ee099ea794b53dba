//! Error log parsing (spec.md section 4.6): a fixed set of regexes maps a line to one of
//! a small set of counters. First match wins.

use once_cell::sync::Lazy;
use regex::Regex;

/// Zero-filled every cycle the log level is verbose enough to see them (spec.md section
/// 4.3: "zero_counters"; grounded on `NginxErrorLogsCollector.zero_counters`).
pub const ZERO_COUNTERS: &[&str] = &[
    "nginx.http.request.buffered",
    "nginx.upstream.response.buffered",
    "nginx.upstream.request.failed",
    "nginx.upstream.response.failed",
];

struct Rule {
    counter: &'static str,
    patterns: &'static [&'static str],
}

static RULES: Lazy<Vec<(Rule, Vec<Regex>)>> = Lazy::new(|| {
    let rules: &[Rule] = &[
        Rule { counter: "nginx.http.request.buffered", patterns: &[".*client request body is buffered.*"] },
        Rule { counter: "nginx.upstream.response.buffered", patterns: &[".*upstream response is buffered.*"] },
        Rule {
            counter: "nginx.upstream.request.failed",
            patterns: &[
                ".*failed.*while connecting to upstream, client.*",
                ".*upstream timed out.*while connecting to upstream, client.*",
                ".*upstream queue is full while connecting to upstream.*",
                ".*no live upstreams while connecting to upstream, client.*",
                ".*upstream connection is closed too while sending request to upstream, client.*",
            ],
        },
        Rule {
            counter: "nginx.upstream.response.failed",
            patterns: &[
                ".*failed.*while reading upstream.*",
                ".*failed.*while reading response header from upstream, client.*",
                ".*upstream timed out.*while reading response header from upstream, client.*",
                ".*upstream buffer is too small to read response.*",
                ".*upstream prematurely closed connection while reading response header from upstream, client.*",
                ".*upstream sent no valid.*header while reading response.*",
                ".*upstream sent invalid header.*",
                ".*upstream sent invalid chunked response.*",
                ".*upstream sent too big header while reading response header from upstream.*",
            ],
        },
    ];

    rules
        .iter()
        .map(|r| {
            let compiled = r.patterns.iter().map(|p| Regex::new(p).expect("static error-log regex is valid")).collect();
            (Rule { counter: r.counter, patterns: r.patterns }, compiled)
        })
        .collect()
});

/// Returns the first matching counter name for `line`, or `None` (spec.md section 4.6).
pub fn classify(line: &str) -> Option<&'static str> {
    for (rule, regexes) in RULES.iter() {
        if regexes.iter().any(|re| re.is_match(line)) {
            return Some(rule.counter);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_buffered_request() {
        let line = "2024/01/01 00:00:00 [warn] 1#1: *1 a client request body is buffered to a temporary file";
        assert_eq!(classify(line), Some("nginx.http.request.buffered"));
    }

    #[test]
    fn classifies_upstream_connect_failure() {
        let line = "2024/01/01 00:00:00 [error] 1#1: *1 connect() failed (111: Connection refused) while connecting to upstream, client: 1.2.3.4";
        assert_eq!(classify(line), Some("nginx.upstream.request.failed"));
    }

    #[test]
    fn classifies_upstream_response_failure() {
        let line = "2024/01/01 00:00:00 [error] 1#1: *1 upstream sent invalid header while reading response header from upstream";
        assert_eq!(classify(line), Some("nginx.upstream.response.failed"));
    }

    #[test]
    fn unmatched_line_returns_none() {
        assert_eq!(classify("2024/01/01 00:00:00 [notice] worker process started"), None);
    }
}
