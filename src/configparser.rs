//! `ConfigParser` (spec.md section 4.5, section 9): external collaborator that turns an
//! NGINX config tree into the structures the config coordinator and endpoint discovery
//! need. Deep NGINX config parsing is out of scope (spec.md section 1 Non-goals) but the
//! crate needs a concrete, good-enough body to drive discovery end to end.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listen {
    pub address: String,
    pub port: u16,
    pub ipv6: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub directives: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerBlock {
    pub listens: Vec<Listen>,
    pub server_names: Vec<String>,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedConfig {
    pub servers: Vec<ServerBlock>,
    /// Every file that was read while resolving `include` directives, root first.
    pub files: Vec<PathBuf>,
    /// `access_log` targets found anywhere in the file tree, `off` excluded
    /// (spec.md section 4.6, S2's source).
    pub access_logs: Vec<String>,
    /// `error_log` targets found anywhere in the file tree, `stderr`/`syslog:` excluded
    /// (spec.md section 4.6, S5's source).
    pub error_logs: Vec<String>,
}

/// A lightweight fingerprint of a file or directory used by the parse-gate to decide
/// whether a reparse is needed (spec.md section 4.5: "files, directories fingerprint").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: PathBuf,
    pub mtime_secs: u64,
    pub permissions_mode: u32,
    pub len: u64,
}

pub trait ConfigParser: Send + Sync {
    fn parse(&self, root_conf_path: &Path) -> Result<ParsedConfig>;
    fn inventory(&self, root_conf_path: &Path) -> Result<Vec<FileMeta>>;
}

/// A recursive-descent parser good enough to drive discovery: tracks `server{}` blocks,
/// their `listen`/`server_name` directives, and `location{}` blocks with their directives,
/// following `include` (including globs) the way NGINX does.
pub struct NginxConfigParser;

impl ConfigParser for NginxConfigParser {
    fn parse(&self, root_conf_path: &Path) -> Result<ParsedConfig> {
        let mut files = Vec::new();
        let tokens = tokenize_recursive(root_conf_path, &mut files)?;
        let mut pos = 0;
        let mut servers = Vec::new();
        collect_servers(&tokens, &mut pos, &mut servers);
        let (access_logs, error_logs) = collect_log_directives(&tokens);
        Ok(ParsedConfig { servers, files, access_logs, error_logs })
    }

    fn inventory(&self, root_conf_path: &Path) -> Result<Vec<FileMeta>> {
        let mut files = Vec::new();
        tokenize_recursive(root_conf_path, &mut files)?;
        files.into_iter().map(|p| file_meta(&p)).collect()
    }
}

fn file_meta(path: &Path) -> Result<FileMeta> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = 0;
    Ok(FileMeta { path: path.to_path_buf(), mtime_secs: mtime, permissions_mode: mode, len: meta.len() })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    BlockOpen,
    BlockClose,
    Semicolon,
}

/// Tokenizes `path`, inlining `include` targets (including simple glob patterns) in
/// place, recording every file visited.
fn tokenize_recursive(path: &Path, files: &mut Vec<PathBuf>) -> Result<Vec<Token>> {
    let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    files.push(path.to_path_buf());

    let raw_tokens = tokenize(&contents);
    let mut out = Vec::new();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut i = 0;
    while i < raw_tokens.len() {
        if let Token::Word(w) = &raw_tokens[i] {
            if w == "include" {
                if let Some(Token::Word(target)) = raw_tokens.get(i + 1) {
                    for included in resolve_include(base_dir, target) {
                        if let Ok(mut sub) = tokenize_recursive(&included, files) {
                            out.append(&mut sub);
                        }
                    }
                    i += 1;
                    if matches!(raw_tokens.get(i + 1), Some(Token::Semicolon)) {
                        i += 1;
                    }
                    i += 1;
                    continue;
                }
            }
        }
        out.push(raw_tokens[i].clone());
        i += 1;
    }

    Ok(out)
}

fn resolve_include(base_dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let candidate = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base_dir.join(pattern)
    };

    if !pattern.contains('*') {
        return vec![candidate];
    }

    let dir = candidate.parent().unwrap_or(base_dir);
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    matches
}

fn tokenize(contents: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = contents.chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<Token>| {
        if !current.is_empty() {
            tokens.push(Token::Word(std::mem::take(current)));
        }
    };

    while let Some(&c) = chars.peek() {
        match c {
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::BlockOpen);
                chars.next();
            }
            '}' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::BlockClose);
                chars.next();
            }
            ';' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Semicolon);
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                while let Some(&c) = chars.peek() {
                    chars.next();
                    if c == quote {
                        break;
                    }
                    current.push(c);
                }
            }
            c if c.is_whitespace() => {
                flush(&mut current, &mut tokens);
                chars.next();
            }
            _ => {
                current.push(c);
                chars.next();
            }
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// Walks the flattened token stream for `server { ... }` blocks, ignoring nesting depth
/// other than matching `{`/`}`.
fn collect_servers(tokens: &[Token], pos: &mut usize, servers: &mut Vec<ServerBlock>) {
    while *pos < tokens.len() {
        if let Token::Word(w) = &tokens[*pos] {
            if w == "server" && matches!(tokens.get(*pos + 1), Some(Token::BlockOpen)) {
                *pos += 2;
                servers.push(parse_server_block(tokens, pos));
                continue;
            }
        }
        if matches!(tokens[*pos], Token::BlockOpen) {
            *pos += 1;
            skip_block(tokens, pos);
            continue;
        }
        *pos += 1;
    }
}

fn skip_block(tokens: &[Token], pos: &mut usize) {
    let mut depth = 1;
    while *pos < tokens.len() && depth > 0 {
        match tokens[*pos] {
            Token::BlockOpen => depth += 1,
            Token::BlockClose => depth -= 1,
            _ => {}
        }
        *pos += 1;
    }
}

fn parse_server_block(tokens: &[Token], pos: &mut usize) -> ServerBlock {
    let mut server = ServerBlock::default();
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::BlockClose => {
                *pos += 1;
                break;
            }
            Token::Word(w) if w == "listen" => {
                let mut args = Vec::new();
                *pos += 1;
                while !matches!(tokens.get(*pos), Some(Token::Semicolon) | None) {
                    if let Some(Token::Word(v)) = tokens.get(*pos) {
                        args.push(v.clone());
                    }
                    *pos += 1;
                }
                *pos += 1;
                if let Some(first) = args.first() {
                    server.listens.push(normalize_listen(first));
                }
            }
            Token::Word(w) if w == "server_name" => {
                *pos += 1;
                while !matches!(tokens.get(*pos), Some(Token::Semicolon) | None) {
                    if let Some(Token::Word(v)) = tokens.get(*pos) {
                        server.server_names.push(v.clone());
                    }
                    *pos += 1;
                }
                *pos += 1;
            }
            Token::Word(w) if w == "location" => {
                *pos += 1;
                let path = match tokens.get(*pos) {
                    Some(Token::Word(p)) => {
                        *pos += 1;
                        p.clone()
                    }
                    _ => String::new(),
                };
                if matches!(tokens.get(*pos), Some(Token::BlockOpen)) {
                    *pos += 1;
                    server.locations.push(parse_location_block(tokens, pos, path));
                }
            }
            Token::BlockOpen => {
                *pos += 1;
                skip_block(tokens, pos);
            }
            _ => {
                *pos += 1;
            }
        }
    }
    server
}

fn parse_location_block(tokens: &[Token], pos: &mut usize, path: String) -> Location {
    let mut loc = Location { path, directives: BTreeMap::new() };
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::BlockClose => {
                *pos += 1;
                break;
            }
            Token::Word(name) => {
                let name = name.clone();
                *pos += 1;
                let mut value_parts = Vec::new();
                while !matches!(tokens.get(*pos), Some(Token::Semicolon) | Some(Token::BlockOpen) | None) {
                    if let Some(Token::Word(v)) = tokens.get(*pos) {
                        value_parts.push(v.clone());
                    }
                    *pos += 1;
                }
                if matches!(tokens.get(*pos), Some(Token::BlockOpen)) {
                    *pos += 1;
                    skip_block(tokens, pos);
                } else {
                    *pos += 1; // semicolon
                }
                loc.directives.insert(name, value_parts.join(" "));
            }
            _ => {
                *pos += 1;
            }
        }
    }
    loc
}

/// Flat scan (nesting-agnostic) for `access_log`/`error_log` directives anywhere in the
/// token stream -- these are legal at `http`, `server`, and `location` scope, and the
/// manager only needs the path, not which block it came from (spec.md section 4.6).
fn collect_log_directives(tokens: &[Token]) -> (Vec<String>, Vec<String>) {
    let mut access = Vec::new();
    let mut error = Vec::new();
    for i in 0..tokens.len() {
        let Token::Word(directive) = &tokens[i] else {
            continue;
        };
        let Some(Token::Word(target)) = tokens.get(i + 1) else {
            continue;
        };
        if directive == "access_log" && target != "off" && !access.contains(target) {
            access.push(target.clone());
        } else if directive == "error_log" && target != "stderr" && !target.starts_with("syslog:") && !error.contains(target) {
            error.push(target.clone());
        }
    }
    (access, error)
}

/// Normalizes a `listen` directive's first argument (spec.md section 4.5: "ipv4/ipv6
/// normalization: `*`/`0.0.0.0` => `127.0.0.1`, `[::]` => `[::1]`, bare numeric => `*:N`").
pub fn normalize_listen(raw: &str) -> Listen {
    if let Some(inner) = raw.strip_prefix('[') {
        if let Some((addr, rest)) = inner.split_once(']') {
            let port = rest.trim_start_matches(':').parse().unwrap_or(80);
            let normalized = if addr == "::" { "::1" } else { addr };
            return Listen { address: format!("[{normalized}]"), port, ipv6: true };
        }
    }

    if let Ok(port) = raw.parse::<u16>() {
        return Listen { address: "*".to_string(), port, ipv6: false };
    }

    let (addr, port) = match raw.rsplit_once(':') {
        Some((a, p)) => (a, p.parse().unwrap_or(80)),
        None => (raw, 80),
    };
    let normalized = if addr == "*" || addr == "0.0.0.0" { "127.0.0.1" } else { addr };
    Listen { address: normalized.to_string(), port, ipv6: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn normalizes_wildcard_and_loopback_listens() {
        assert_eq!(normalize_listen("0.0.0.0:80").address, "127.0.0.1");
        assert_eq!(normalize_listen("*:8080").address, "127.0.0.1");
        assert_eq!(normalize_listen("[::]:443").address, "[::1]");
        assert_eq!(normalize_listen("9090"), Listen { address: "*".to_string(), port: 9090, ipv6: false });
    }

    #[test]
    fn parses_server_block_with_listen_and_stub_status_location() {
        let conf = r#"
http {
    server {
        listen 0.0.0.0:80;
        server_name example.com;
        location /basic_status {
            stub_status on;
        }
    }
}
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(conf.as_bytes()).unwrap();

        let parsed = NginxConfigParser.parse(&path).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        let server = &parsed.servers[0];
        assert_eq!(server.listens[0].address, "127.0.0.1");
        assert_eq!(server.server_names, vec!["example.com"]);
        assert_eq!(server.locations[0].path, "/basic_status");
        assert_eq!(server.locations[0].directives.get("stub_status"), Some(&"on".to_string()));
    }

    #[test]
    fn follows_include_directive() {
        let dir = tempfile::tempdir().unwrap();
        let included_path = dir.path().join("servers.conf");
        fs::write(&included_path, "server { listen 8081; }").unwrap();

        let main_path = dir.path().join("nginx.conf");
        fs::write(&main_path, format!("http {{ include {}; }}", included_path.display())).unwrap();

        let parsed = NginxConfigParser.parse(&main_path).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.files.len(), 2);
    }

    #[test]
    fn collects_access_and_error_log_paths_ignoring_off_and_stderr() {
        let conf = r#"
http {
    access_log /var/log/nginx/access.log combined;
    error_log /var/log/nginx/error.log warn;
    server {
        listen 80;
        access_log off;
        error_log stderr;
    }
}
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");
        fs::write(&path, conf).unwrap();

        let parsed = NginxConfigParser.parse(&path).unwrap();
        assert_eq!(parsed.access_logs, vec!["/var/log/nginx/access.log".to_string()]);
        assert_eq!(parsed.error_logs, vec!["/var/log/nginx/error.log".to_string()]);
    }

    #[test]
    fn inventory_reports_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");
        fs::write(&path, "http {}").unwrap();
        let inventory = NginxConfigParser.inventory(&path).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].path, path);
    }
}
