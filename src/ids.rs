//! Rule id allocation.

use crate::rule::{RuleId, MAX_RULE_ID};
use rand::Rng;
use std::collections::HashSet;

/// Draws random rule ids, retrying on collision with ids already in use.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    max_attempts: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self { max_attempts: 64 }
    }
}

impl IdAllocator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Allocate an id not contained in `taken`.
    ///
    /// Falls back to the smallest free id when random draws keep colliding,
    /// so allocation only fails when the whole id space is exhausted.
    pub fn allocate(&self, taken: &HashSet<RuleId>) -> Option<RuleId> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.max_attempts {
            let id = rng.gen_range(1..=MAX_RULE_ID);
            if !taken.contains(&id) {
                return Some(id);
            }
        }
        (1..=MAX_RULE_ID).find(|id| !taken.contains(id))
    }
}
