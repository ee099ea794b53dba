//! `HTTPClient` (spec.md section 6): the outbound transport seam to the cloud receiver,
//! plus localhost probing of NGINX status endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::version::Version;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[async_trait]
pub trait HTTPClient: Send + Sync {
    async fn post_json(&self, url: &str, body: &[u8], gzip: bool) -> Result<HttpResponse>;
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse>;
}

/// Default `reqwest`-backed client (spec.md section 6 headers: `Content-Type`,
/// `User-Agent`, optional `Content-Encoding: gzip`).
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    user_agent: String,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration, verify_ssl_cert: bool, version: Version) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl_cert)
            .build()
            .context("failed to build HTTP client")?;
        Ok(ReqwestHttpClient { client, user_agent: version.user_agent() })
    }
}

#[async_trait]
impl HTTPClient for ReqwestHttpClient {
    async fn post_json(&self, url: &str, body: &[u8], gzip: bool) -> Result<HttpResponse> {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent);

        let payload = if gzip {
            req = req.header("Content-Encoding", "gzip");
            gzip_encode(body)?
        } else {
            body.to_vec()
        };

        let resp = req.body(payload).send().await.context("POST failed")?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("failed reading response body")?.to_vec();
        Ok(HttpResponse { status, body })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .context("GET failed")?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("failed reading response body")?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

fn gzip_encode(body: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).context("gzip encode failed")?;
    encoder.finish().context("gzip finish failed")
}

/// 503 bodies are parsed as an integer retry-after in seconds, defaulting to 60
/// (spec.md section 6).
pub fn parse_backpressure_retry_after(body: &str) -> u64 {
    body.trim().parse().unwrap_or(60)
}

/// The `{api_url}/{api_key}/update/` and `{api_url}/{api_key}/agent/` endpoint builders
/// (spec.md section 6).
pub fn update_url(api_url: &str, api_key: &str) -> String {
    format!("{}/{}/update/", api_url.trim_end_matches('/'), api_key)
}

pub fn agent_url(api_url: &str, api_key: &str) -> String {
    format!("{}/{}/agent/", api_url.trim_end_matches('/'), api_key)
}

/// The control-plane handshake response shape (spec.md section 6).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentHandshakeResponse {
    pub config: Value,
    #[serde(default)]
    pub objects: Vec<Value>,
    pub versions: HandshakeVersions,
    #[serde(default)]
    pub capabilities: std::collections::BTreeMap<String, bool>,
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Cloud-assigned root identity on a first-ever handshake (SPEC_FULL.md C.2).
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct HandshakeVersions {
    pub current: String,
    pub obsolete: String,
    pub old: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_retry_after_parses_integer_body() {
        assert_eq!(parse_backpressure_retry_after("30"), 30);
        assert_eq!(parse_backpressure_retry_after(" 45 \n"), 45);
    }

    #[test]
    fn backpressure_retry_after_defaults_when_unparseable() {
        assert_eq!(parse_backpressure_retry_after("not a number"), 60);
    }

    #[test]
    fn endpoint_urls_are_built_correctly() {
        assert_eq!(update_url("https://example.com/", "key1"), "https://example.com/key1/update/");
        assert_eq!(agent_url("https://example.com", "key1"), "https://example.com/key1/agent/");
    }

    #[test]
    fn handshake_response_deserializes() {
        let json = serde_json::json!({
            "config": {},
            "objects": [],
            "versions": {"current": "2.0.0", "obsolete": "1.0.0", "old": "1.20.0"},
            "capabilities": {"plus": true},
            "messages": []
        });
        let parsed: AgentHandshakeResponse = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.versions.current, "2.0.0");
        assert_eq!(parsed.capabilities.get("plus"), Some(&true));
    }

    #[test]
    fn gzip_round_trips_through_flate2_decoder() {
        let data = b"hello world, this is a test payload";
        let encoded = gzip_encode(data).unwrap();

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(&encoded[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, data);
    }
}
