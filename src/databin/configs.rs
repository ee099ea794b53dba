//! The config bin (spec.md section 3): `{payload, checksum}`, resent unchanged every
//! `resend_wait_time` to survive the backend losing its copy of our state.

use std::time::Duration;

use serde_json::Value;

use crate::clock::unix_timestamp;

const DEFAULT_RESEND_WAIT_SECS: i64 = 4 * 60 * 60;

pub struct ConfigsBin {
    pending: Option<(Value, String)>,
    last_sent: Option<(String, i64)>,
    resend_wait: Duration,
}

impl Default for ConfigsBin {
    fn default() -> Self {
        ConfigsBin {
            pending: None,
            last_sent: None,
            resend_wait: Duration::from_secs(DEFAULT_RESEND_WAIT_SECS as u64),
        }
    }
}

impl ConfigsBin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resend_wait(resend_wait: Duration) -> Self {
        ConfigsBin {
            resend_wait,
            ..Self::default()
        }
    }

    /// Enqueue a config payload for sending. `checksum` identifies the content so unchanged
    /// configs aren't re-sent every flush cycle (spec.md section 4.5).
    pub fn set(&mut self, payload: Value, checksum: impl Into<String>) {
        self.pending = Some((payload, checksum.into()));
    }

    /// Emit the pending payload if its checksum differs from the last send, or if
    /// `resend_wait` has elapsed since the last send of the same checksum.
    pub fn flush(&mut self) -> Option<(Value, String)> {
        let (payload, checksum) = self.pending.take()?;
        let now = unix_timestamp();

        let should_send = match &self.last_sent {
            None => true,
            Some((last_checksum, last_ts)) => {
                last_checksum != &checksum || now - last_ts >= self.resend_wait.as_secs() as i64
            }
        };

        if should_send {
            self.last_sent = Some((checksum.clone(), now));
            Some((payload, checksum))
        } else {
            None
        }
    }
}
