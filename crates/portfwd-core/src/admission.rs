//! Admission control: the per-rule concurrency cap.
//!
//! Caps are configured in full connections while the counter tracks
//! half-connections, so a rule with cap `N` rejects once the count reaches
//! `2 * N`.

use crate::counter::ConnectionCounter;
use crate::error::{ForwardError, ForwardResult};
use crate::rules::{RuleIndex, RuleTable};
use std::sync::Arc;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Half-connection count observed for the rule.
    pub current: usize,
    /// Whether the new connection may proceed.
    pub allowed: bool,
}

impl Admission {
    /// Observed count expressed in full connections.
    pub fn connections(&self) -> usize {
        self.current / 2
    }
}

/// Whether a rule capped at `max_simultaneous` connections is full at
/// `current` half-connections. A cap of `0` is never full.
pub fn limit_reached(max_simultaneous: usize, current: usize) -> bool {
    max_simultaneous != 0 && current >= max_simultaneous.saturating_mul(2)
}

/// Gate consulted before dialing the forward target.
///
/// Performs a synchronized read of the counter and never mutates it.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    rules: Arc<RuleTable>,
    counter: Arc<ConnectionCounter>,
}

impl AdmissionController {
    pub fn new(rules: Arc<RuleTable>, counter: Arc<ConnectionCounter>) -> Self {
        Self { rules, counter }
    }

    /// Decide whether a new inbound connection for `index` may proceed.
    pub fn admit(&self, index: RuleIndex) -> ForwardResult<Admission> {
        let rule = self
            .rules
            .get(index)
            .ok_or(ForwardError::UnknownRule(index))?;
        let current = self.counter.peek(index)?;
        Ok(Admission {
            current,
            allowed: !limit_reached(rule.max_simultaneous, current),
        })
    }
}
