//! Forwarding rules and the process-wide idle timeout.
//!
//! A [`RuleTable`] is built once at startup, validated, and then shared
//! read-only (behind an `Arc`) by every listener and connection task.
//! Rules are addressed by their position in the table ([`RuleIndex`]),
//! which is also the key into the
//! [`ConnectionCounter`](crate::counter::ConnectionCounter).

use crate::error::{ForwardError, ForwardResult};
use std::fmt;
use std::time::Duration;

/// Position of a rule in the [`RuleTable`].
pub type RuleIndex = usize;

/// One configured `listen port → forward address` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Free-form label. Has no effect other than appearing in logs.
    pub name: Option<String>,
    /// Local TCP port to accept connections on.
    pub listen_port: u16,
    /// `host:port` of the forward target.
    pub forward_address: String,
    /// Maximum number of simultaneous forwarded connections. `0` = no limit.
    pub max_simultaneous: usize,
}

impl Rule {
    /// Create an unnamed, unlimited rule.
    pub fn new(listen_port: u16, forward_address: impl Into<String>) -> Self {
        Self {
            name: None,
            listen_port,
            forward_address: forward_address.into(),
            max_simultaneous: 0,
        }
    }

    /// Set the rule's label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Cap the number of simultaneous connections (`0` = no limit).
    pub fn with_limit(mut self, max_simultaneous: usize) -> Self {
        self.max_simultaneous = max_simultaneous;
        self
    }

    /// Label used in log fields: the rule name, or the listen port.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.listen_port.to_string(),
        }
    }

    fn validate(&self, position: usize) -> ForwardResult<()> {
        if self.listen_port == 0 {
            return Err(ForwardError::InvalidRule {
                rule: position,
                reason: "does not have a valid port number".to_string(),
            });
        }
        if self.forward_address.trim().is_empty() {
            return Err(ForwardError::InvalidRule {
                rule: position,
                reason: "does not have a forward address".to_string(),
            });
        }
        Ok(())
    }
}

/// Immutable, validated list of forwarding rules.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Validate `rules` and build the table.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::InvalidRule`] for the first rule with a zero
    /// listen port or an empty forward address. No partial table is built.
    pub fn new(rules: Vec<Rule>) -> ForwardResult<Self> {
        for (index, rule) in rules.iter().enumerate() {
            rule.validate(index + 1)?;
        }
        Ok(Self { rules })
    }

    pub fn get(&self, index: RuleIndex) -> Option<&Rule> {
        self.rules.get(index)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate `(index, rule)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (RuleIndex, &Rule)> {
        self.rules.iter().enumerate()
    }
}

/// Maximum allowed gap between successful reads/writes on a half-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleTimeout {
    /// No deadline: reads and writes block indefinitely.
    #[default]
    Disabled,
    /// Deadline of `now + duration` armed before every read and every write.
    After(Duration),
}

impl IdleTimeout {
    /// Interpret a configured number of seconds. `<= 0` disables the timeout.
    pub fn from_secs(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(secs) => Self::from_duration(Duration::from_secs(secs)),
            Err(_) => IdleTimeout::Disabled,
        }
    }

    /// A zero duration disables the timeout.
    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            IdleTimeout::Disabled
        } else {
            IdleTimeout::After(duration)
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            IdleTimeout::Disabled => None,
            IdleTimeout::After(d) => Some(*d),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, IdleTimeout::After(_))
    }
}

impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleTimeout::Disabled => f.write_str("disabled"),
            IdleTimeout::After(d) => write!(f, "{d:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_table() {
        let table = RuleTable::new(vec![
            Rule::new(9000, "127.0.0.1:9100").with_limit(1),
            Rule::new(9001, "example.com:80").with_name("web"),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().max_simultaneous, 1);
        assert_eq!(table.get(1).unwrap().label(), "web");
        assert!(table.get(2).is_none());
    }

    #[test]
    fn zero_port_is_rejected_with_rule_number() {
        let err = RuleTable::new(vec![
            Rule::new(9000, "127.0.0.1:9100"),
            Rule::new(0, "127.0.0.1:9100"),
        ])
        .unwrap_err();
        match err {
            ForwardError::InvalidRule { rule, .. } => assert_eq!(rule, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_forward_is_rejected() {
        let err = RuleTable::new(vec![Rule::new(9000, "  ")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "rule number 1 does not have a forward address"
        );
    }

    #[test]
    fn empty_table_is_allowed() {
        assert!(RuleTable::new(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn label_falls_back_to_port() {
        assert_eq!(Rule::new(8080, "a:1").label(), "8080");
        assert_eq!(Rule::new(8080, "a:1").with_name("").label(), "8080");
    }

    #[test]
    fn idle_timeout_from_secs() {
        assert_eq!(IdleTimeout::from_secs(0), IdleTimeout::Disabled);
        assert_eq!(IdleTimeout::from_secs(-5), IdleTimeout::Disabled);
        assert_eq!(
            IdleTimeout::from_secs(2),
            IdleTimeout::After(Duration::from_secs(2))
        );
        assert!(!IdleTimeout::Disabled.is_enabled());
        assert_eq!(IdleTimeout::from_duration(Duration::ZERO), IdleTimeout::Disabled);
    }
}
