//! `SyslogListener` (spec.md section 4.6): a UDP server that splits datagrams at the
//! literal `"amplify: "` marker (configurable per SPEC_FULL.md D) into a bounded deque
//! consumers snapshot-and-clear each cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::collector::Stoppable;

pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Shared cache the UDP receive loop appends to and log collectors drain from
/// (spec.md section 4.6: "Consumers obtain a snapshot of the deque per iteration; the
/// snapshot is cleared after hand-off").
pub struct SyslogCache {
    lines: Mutex<VecDeque<String>>,
    max_len: usize,
}

impl SyslogCache {
    pub fn new(max_len: usize) -> Arc<Self> {
        Arc::new(SyslogCache { lines: Mutex::new(VecDeque::with_capacity(max_len.min(1024))), max_len })
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.max_len {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Takes every buffered line, leaving the cache empty.
    pub fn drain_snapshot(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock()).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A running UDP listener bound to one address (spec.md section 4.6).
pub struct SyslogListener {
    cache: Arc<SyslogCache>,
    marker: String,
    closed: Arc<AtomicBool>,
}

impl SyslogListener {
    /// Binds `address` and spawns the receive loop. Returns an error the caller should
    /// retry (address collisions are tracked process-wide and retried up to 3 times
    /// then suppressed -- spec.md section 4.6).
    pub async fn bind(address: &str, cache: Arc<SyslogCache>, marker: impl Into<String>) -> Result<Self> {
        let socket = UdpSocket::bind(address).await.with_context(|| format!("binding syslog listener to {address}"))?;
        let marker = marker.into();
        let closed = Arc::new(AtomicBool::new(false));

        let task_cache = cache.clone();
        let task_marker = marker.clone();
        let task_closed = closed.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                if task_closed.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(std::time::Duration::from_millis(500), socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => {
                        let datagram = String::from_utf8_lossy(&buf[..n]);
                        match split_on_marker(&datagram, &task_marker) {
                            Some(record) => task_cache.push(record.to_string()),
                            None => warn!(%datagram, "syslog datagram missing marker, dropping"),
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "syslog socket read failed");
                    }
                    Err(_timeout) => {}
                }
            }
            debug!("syslog listener loop exiting");
        });

        Ok(SyslogListener { cache, marker, closed })
    }

    pub fn cache(&self) -> Arc<SyslogCache> {
        self.cache.clone()
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Stoppable for SyslogListener {
    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Splits `datagram` on the first occurrence of `marker`, returning the suffix
/// (spec.md section 4.6: "split at the literal delimiter").
pub fn split_on_marker<'a>(datagram: &'a str, marker: &str) -> Option<&'a str> {
    datagram.trim().split_once(marker).map(|(_, suffix)| suffix)
}
