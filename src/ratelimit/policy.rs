//! Policy table: which strategy and parameters apply to an action.
//!
//! Rules are keyed by action, optionally narrowed to one subject. A rule
//! naming the subject wins over a rule for the whole action.
//!
//! ```yaml
//! policies:
//!   - action: create-order
//!     policy:
//!       strategy: sliding_window
//!       period_secs: 5
//!       max_count: 3
//!   - action: search
//!     policy:
//!       strategy: funnel
//!       capacity: 15
//!       leak_rate: 0.5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{HivequotaError, Result};

/// A complete policy table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// One entry of the policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// The action this rule governs
    pub action: String,
    /// Restrict the rule to a single subject
    #[serde(default)]
    pub subject: Option<String>,
    /// What to enforce
    pub policy: Policy,
}

/// Strategy and parameters for a limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Policy {
    /// At most `max_count` attempts in any trailing `period_secs`
    SlidingWindow { period_secs: u64, max_count: u64 },
    /// Leaky bucket; each check costs `quota_units`
    Funnel {
        capacity: f64,
        leak_rate: f64,
        #[serde(default = "default_quota_units")]
        quota_units: f64,
    },
}

fn default_quota_units() -> f64 {
    1.0
}

impl Policy {
    /// Check the parameters without touching any store.
    pub fn validate(&self) -> Result<()> {
        match self {
            Policy::SlidingWindow { period_secs, .. } => {
                if *period_secs == 0 {
                    return Err(HivequotaError::Config("period_secs must be positive".into()));
                }
            }
            Policy::Funnel {
                capacity,
                leak_rate,
                quota_units,
            } => {
                for (name, value) in [
                    ("capacity", capacity),
                    ("leak_rate", leak_rate),
                    ("quota_units", quota_units),
                ] {
                    if !value.is_finite() || *value < 0.0 {
                        return Err(HivequotaError::Config(format!(
                            "{} must be a finite, non-negative number, got {}",
                            name, value
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml)
            .map_err(|e| HivequotaError::Config(format!("Failed to parse policy table: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    /// Validate every rule.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.policies {
            rule.policy.validate().map_err(|e| match e {
                HivequotaError::Config(msg) => {
                    HivequotaError::Config(format!("policy for action {}: {}", rule.action, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Find the policy governing `subject` performing `action`.
    pub fn find(&self, subject: &str, action: &str) -> Option<&Policy> {
        let mut action_wide = None;
        for rule in self.policies.iter().filter(|r| r.action == action) {
            match &rule.subject {
                Some(s) if s == subject => return Some(&rule.policy),
                Some(_) => {}
                None => {
                    if action_wide.is_none() {
                        action_wide = Some(&rule.policy);
                    }
                }
            }
        }
        action_wide
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        let yaml = r#"
policies:
  - action: create-order
    policy:
      strategy: sliding_window
      period_secs: 5
      max_count: 3
  - action: search
    policy:
      strategy: funnel
      capacity: 15
      leak_rate: 0.5
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();
        assert_eq!(table.policies.len(), 2);
        assert_eq!(
            table.find("anyone", "create-order"),
            Some(&Policy::SlidingWindow {
                period_secs: 5,
                max_count: 3
            })
        );
        assert_eq!(
            table.find("anyone", "search"),
            Some(&Policy::Funnel {
                capacity: 15.0,
                leak_rate: 0.5,
                quota_units: 1.0
            })
        );
    }

    #[test]
    fn test_subject_rule_takes_precedence() {
        let yaml = r#"
policies:
  - action: create-order
    policy:
      strategy: sliding_window
      period_secs: 60
      max_count: 10
  - action: create-order
    subject: vip
    policy:
      strategy: sliding_window
      period_secs: 60
      max_count: 1000
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();

        let vip = table.find("vip", "create-order").unwrap();
        assert_eq!(
            *vip,
            Policy::SlidingWindow {
                period_secs: 60,
                max_count: 1000
            }
        );

        let regular = table.find("someone", "create-order").unwrap();
        assert_eq!(
            *regular,
            Policy::SlidingWindow {
                period_secs: 60,
                max_count: 10
            }
        );
    }

    #[test]
    fn test_no_match() {
        let table = PolicyTable::from_yaml("policies: []").unwrap();
        assert!(table.find("u", "a").is_none());
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let yaml = r#"
policies:
  - action: a
    policy:
      strategy: sliding_window
      period_secs: 0
      max_count: 1
"#;
        assert!(matches!(
            PolicyTable::from_yaml(yaml),
            Err(HivequotaError::Config(_))
        ));
    }

    #[test]
    fn test_negative_leak_rate_is_rejected() {
        let yaml = r#"
policies:
  - action: a
    policy:
      strategy: funnel
      capacity: 1
      leak_rate: -0.5
"#;
        assert!(matches!(
            PolicyTable::from_yaml(yaml),
            Err(HivequotaError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let yaml = r#"
policies:
  - action: a
    policy:
      strategy: fixed_window
"#;
        assert!(PolicyTable::from_yaml(yaml).is_err());
    }
}
