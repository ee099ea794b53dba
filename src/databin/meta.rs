//! The meta bin (spec.md section 3): a whole-object replace-on-flush key/value bag.

use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct MetaBin {
    current: Option<BTreeMap<String, Value>>,
}

impl MetaBin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole meta payload. Called once per cycle by `AbstractMetaCollector`
    /// with `default_meta ∪ sampler_updates` (spec.md section 4.3).
    pub fn set(&mut self, meta: BTreeMap<String, Value>) {
        self.current = Some(meta);
    }

    /// Meta is emitted every cycle it has a value, not only on change -- the Bridge's
    /// first-send gating (spec.md section 4.7) relies on this to guarantee the backend
    /// always has object definitions before metrics arrive.
    pub fn flush(&mut self) -> Option<BTreeMap<String, Value>> {
        self.current.clone()
    }
}
