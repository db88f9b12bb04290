//! Keyword filter for outgoing replies.
//!
//! Scans text case-insensitively for configured trigger phrases; on a match
//! the whole reply is swapped for one of that trigger's replacement
//! candidates, chosen at random. Which trigger wins when several match is
//! implementation-defined (map iteration order).

use rand::Rng;
use std::collections::HashMap;

/// Stateless keyword filter: trigger phrase -> replacement candidates.
pub struct KeywordFilter {
    map: HashMap<String, Vec<String>>,
}

impl KeywordFilter {
    /// Build a filter from the configured mapping. Trigger phrases are
    /// matched lowercase, so keys are normalized here once.
    pub fn new(map: HashMap<String, Vec<String>>) -> Self {
        let map = map
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { map }
    }

    /// Filter with the thread-local RNG.
    pub fn apply(&self, text: &str) -> String {
        self.apply_with(text, &mut rand::rng())
    }

    /// Filter with an injected RNG (deterministic in tests).
    pub fn apply_with<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> String {
        let lower = text.to_lowercase();
        for (trigger, candidates) in &self.map {
            if candidates.is_empty() {
                continue;
            }
            if lower.contains(trigger.as_str()) {
                let idx = rng.random_range(0..candidates.len());
                return candidates[idx].clone();
            }
        }
        text.to_string()
    }
}
