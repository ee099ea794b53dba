//! The events bin (spec.md section 3): coalesced, leveled log-style messages.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::clock::unix_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub level: EventLevel,
    pub message: String,
    pub ctime: i64,
    pub counter: u32,
}

#[derive(Default)]
pub struct EventsBin {
    /// Keyed by `(level, message)`; coalesced within one flush cycle by bumping `counter`.
    current: Vec<Event>,
    /// Dedupe keys for events pushed with `push_onetime`, persisted across the object's
    /// whole lifetime (never cleared on flush).
    onetime_seen: HashSet<String>,
}

impl EventsBin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event. Identical `(level, message)` pairs within the same flush cycle are
    /// coalesced by incrementing `counter` instead of appending a duplicate record.
    pub fn push(&mut self, level: EventLevel, message: impl Into<String>) {
        let message = message.into();
        if let Some(existing) = self
            .current
            .iter_mut()
            .find(|e| e.level == level && e.message == message)
        {
            existing.counter += 1;
            return;
        }
        self.current.push(Event {
            level,
            message,
            ctime: unix_timestamp(),
            counter: 1,
        });
    }

    /// Push an event only if an event with the same dedupe key has never been pushed
    /// before on this object (spec.md section 3, "onetime events").
    pub fn push_onetime(&mut self, dedupe_key: impl Into<String>, level: EventLevel, message: impl Into<String>) {
        let dedupe_key = dedupe_key.into();
        if self.onetime_seen.contains(&dedupe_key) {
            return;
        }
        self.onetime_seen.insert(dedupe_key);
        self.push(level, message);
    }

    pub fn flush(&mut self) -> Option<Vec<Event>> {
        if self.current.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_events_coalesce_within_a_cycle() {
        let mut bin = EventsBin::new();
        bin.push(EventLevel::Warning, "config parse failed");
        bin.push(EventLevel::Warning, "config parse failed");
        let events = bin.flush().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].counter, 2);
    }

    #[test]
    fn different_levels_do_not_coalesce() {
        let mut bin = EventsBin::new();
        bin.push(EventLevel::Info, "nginx config parsed");
        bin.push(EventLevel::Warning, "nginx config parsed");
        let events = bin.flush().unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn onetime_events_never_repeat_across_lifetime() {
        let mut bin = EventsBin::new();
        bin.push_onetime("restarted", EventLevel::Info, "nginx restarted");
        bin.flush();
        bin.push_onetime("restarted", EventLevel::Info, "nginx restarted");
        assert!(bin.flush().is_none());
    }

    #[test]
    fn empty_bin_flushes_to_none() {
        let mut bin = EventsBin::new();
        assert!(bin.flush().is_none());
    }
}
