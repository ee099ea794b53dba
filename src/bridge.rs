//! The Bridge (spec.md section 4.7): periodically walks the object tree per bin kind,
//! appends the nested document to a bounded deque, and attempts delivery to the cloud
//! receiver subject to backpressure/backoff gating.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::clock::CancelToken;
use crate::config::ConfigTank;
use crate::httpclient::{parse_backpressure_retry_after, update_url, HTTPClient};
use crate::object::ObjectId;
use crate::tank::ObjectTank;

/// Bridge deques are capped at 360 entries (spec.md section 5, "Bounded memory").
const DEQUE_CAP: usize = 360;

const BIN_KINDS: [&str; 4] = ["meta", "metrics", "events", "configs"];

/// A length-capped queue of flushed documents for one bin kind.
struct BoundedDeque {
    items: VecDeque<Value>,
}

impl BoundedDeque {
    fn new() -> Self {
        BoundedDeque { items: VecDeque::with_capacity(DEQUE_CAP) }
    }

    fn push(&mut self, doc: Value) {
        if self.items.len() >= DEQUE_CAP {
            self.items.pop_front();
        }
        self.items.push_back(doc);
    }

    fn snapshot(&self) -> Vec<Value> {
        self.items.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Default)]
struct Deques {
    meta: BoundedDeque,
    metrics: BoundedDeque,
    events: BoundedDeque,
    configs: BoundedDeque,
}

impl Default for BoundedDeque {
    fn default() -> Self {
        BoundedDeque::new()
    }
}

impl Deques {
    fn deque_mut(&mut self, kind: &str) -> &mut BoundedDeque {
        match kind {
            "meta" => &mut self.meta,
            "metrics" => &mut self.metrics,
            "events" => &mut self.events,
            "configs" => &mut self.configs,
            _ => unreachable!("bridge only handles the four bin kinds"),
        }
    }

    fn all_empty(&self) -> bool {
        self.meta.is_empty() && self.metrics.is_empty() && self.events.is_empty() && self.configs.is_empty()
    }

    fn clear_all(&mut self) {
        self.meta.clear();
        self.metrics.clear();
        self.events.clear();
        self.configs.clear();
    }
}

struct SendState {
    last_attempt: Instant,
    backpressure_until: Instant,
    fail_count: u32,
    http_delay: Duration,
}

impl SendState {
    fn new(now: Instant) -> Self {
        SendState { last_attempt: now, backpressure_until: now, fail_count: 0, http_delay: Duration::ZERO }
    }
}

/// `exponential_delay(n) = uniform_int(0, min(0.5*15*2^n, 3600) - 1)` for `n >= 1`, else 0
/// (spec.md section 4.7).
fn exponential_delay(fail_count: u32) -> Duration {
    if fail_count == 0 {
        return Duration::ZERO;
    }
    let cap = (0.5 * 15.0 * 2f64.powi(fail_count as i32)).min(3600.0);
    let upper = (cap as u64).max(1);
    let jitter = rand::thread_rng().gen_range(0..upper);
    Duration::from_secs(jitter)
}

/// Delivers per-object flush snapshots to the cloud receiver (spec.md section 4.7).
pub struct Bridge {
    tank: Arc<ObjectTank>,
    http: Arc<dyn HTTPClient>,
    config: ConfigTank,
    deques: Mutex<Deques>,
    state: Mutex<SendState>,
    sent_once: AtomicBool,
}

impl Bridge {
    pub fn new(tank: Arc<ObjectTank>, http: Arc<dyn HTTPClient>, config: ConfigTank) -> Arc<Self> {
        Arc::new(Bridge {
            tank,
            http,
            config,
            deques: Mutex::new(Deques::default()),
            state: Mutex::new(SendState::new(Instant::now())),
            sent_once: AtomicBool::new(false),
        })
    }

    /// Runs the tick loop at `cloud.push_interval` cadence, re-read every cycle so a
    /// cloud-pushed interval change takes effect on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        loop {
            let interval = self.config.snapshot().cloud.push_interval;
            if !cancel.sleep(interval).await {
                break;
            }
            self.cycle(Instant::now()).await;
        }
    }

    /// One tick: walk, append, maybe-send (spec.md section 4.7).
    async fn cycle(&self, now: Instant) {
        self.collect();
        self.maybe_send(now).await;
    }

    /// Forces an out-of-cycle walk+append+send attempt (spec.md section 4.8:
    /// "flush all metrics once" on a global config diff).
    pub async fn force(&self) {
        self.collect();
        self.maybe_send(Instant::now()).await;
    }

    /// Walks the object tree per bin kind and appends to the matching deque. Only `meta`
    /// is populated before the first successful send (spec.md section 4.7, "On first
    /// send").
    fn collect(&self) {
        let first_send_pending = !self.sent_once.load(Ordering::SeqCst);
        let mut deques = self.deques.lock();
        for kind in BIN_KINDS {
            if first_send_pending && kind != "meta" {
                continue;
            }
            if let Some(doc) = self.flush_tree(kind) {
                deques.deque_mut(kind).push(doc);
            }
        }
    }

    fn flush_tree(&self, kind: &str) -> Option<Value> {
        let root_id = self.tank.root_id()?;
        self.flush_node(root_id, kind)
    }

    /// `{object, <kind>, children:[...]}`, pruning a node whose only key is `object`
    /// (spec.md section 4.7).
    fn flush_node(&self, id: ObjectId, kind: &str) -> Option<Value> {
        let obj = self.tank.find_one(id)?;
        let mut map = serde_json::Map::new();
        map.insert("object".to_string(), json!(id.0));

        if let Some(v) = obj.flush(&[kind]) {
            map.insert(kind.to_string(), v);
        }

        let children: Vec<Value> = self
            .tank
            .find_children(id)
            .into_iter()
            .filter_map(|child| self.flush_node(child.id, kind))
            .collect();
        if !children.is_empty() {
            map.insert("children".to_string(), Value::Array(children));
        }

        if map.len() == 1 {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    async fn maybe_send(&self, now: Instant) {
        let push_interval = self.config.snapshot().cloud.push_interval;

        let ready = {
            let state = self.state.lock();
            now >= state.last_attempt + push_interval + state.http_delay && now > state.backpressure_until
        };
        if !ready {
            return;
        }

        let payload = {
            let deques = self.deques.lock();
            if deques.all_empty() {
                return;
            }
            json!({
                "meta": deques.meta.snapshot(),
                "metrics": deques.metrics.snapshot(),
                "events": deques.events.snapshot(),
                "configs": deques.configs.snapshot(),
            })
        };

        self.state.lock().last_attempt = now;

        let snapshot = self.config.snapshot();
        let url = update_url(&snapshot.cloud.api_url, &snapshot.credentials.api_key);
        let body = serde_json::to_vec(&payload).unwrap_or_default();
        let gzip = snapshot.cloud.gzip > 0;

        match self.http.post_json(&url, &body, gzip).await {
            Ok(resp) if resp.status == 503 => {
                let retry_after = parse_backpressure_retry_after(&resp.text());
                debug!(retry_after, "cloud signaled backpressure");
                self.state.lock().backpressure_until = now + Duration::from_secs(retry_after);
            }
            Ok(resp) if (200..300).contains(&resp.status) => {
                self.deques.lock().clear_all();
                let mut state = self.state.lock();
                state.fail_count = 0;
                state.http_delay = Duration::ZERO;
                self.sent_once.store(true, Ordering::SeqCst);
            }
            Ok(resp) => {
                warn!(status = resp.status, "update push rejected");
                self.bump_backoff();
            }
            Err(e) => {
                warn!(error = %e, "update push failed");
                self.bump_backoff();
            }
        }
    }

    fn bump_backoff(&self) {
        let mut state = self.state.lock();
        state.fail_count += 1;
        state.http_delay = exponential_delay(state.fail_count);
    }
}
