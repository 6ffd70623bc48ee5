//! Rate limit rules configuration and matching.
//!
//! A rule table maps request paths to `(limit, window)` pairs. Lookup is
//! deterministic: an exact path match wins over any prefix, the longest
//! matching prefix wins over shorter ones, and the default rule catches
//! everything else.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, VigilError};

/// A limit of `limit` operations per `window_secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Operations allowed per window (bucket capacity)
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Rule {
    /// Create a rule.
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.limit) / self.window_secs as f64
    }

    /// Reject rules that would produce an empty bucket or a non-finite rate.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(VigilError::Config("rule limit must be at least 1".to_string()));
        }
        if self.window_secs == 0 {
            return Err(VigilError::Config(
                "rule window_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a configured path is compared against request paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatch {
    /// Only the exact path
    Exact,
    /// Any path starting with the configured string
    Prefix,
    /// Both: exact when equal, otherwise as a prefix
    #[default]
    Any,
}

/// A single configured rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// The path or path prefix this rule applies to
    pub path: String,
    /// Operations allowed per window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// How `path` is matched
    #[serde(default, rename = "match")]
    pub kind: PathMatch,
}

impl RuleConfig {
    /// Create a rule entry matching both exactly and by prefix.
    pub fn new(path: &str, limit: u32, window_secs: u64) -> Self {
        Self {
            path: path.to_string(),
            limit,
            window_secs,
            kind: PathMatch::Any,
        }
    }

    /// Override the match kind.
    pub fn with_match(mut self, kind: PathMatch) -> Self {
        self.kind = kind;
        self
    }

    /// The `(limit, window)` part of this entry.
    pub fn rule(&self) -> Rule {
        Rule::new(self.limit, self.window_secs)
    }
}

/// Serialized form of a rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTableConfig {
    /// Rule applied when nothing else matches
    pub default: Rule,
    /// Path-specific rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Which entry a lookup landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch<'a> {
    /// Matched a configured path exactly
    Exact(&'a str),
    /// Matched the longest configured prefix
    Prefix(&'a str),
    /// Fell through to the default rule
    Default,
}

impl std::fmt::Display for RuleMatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleMatch::Exact(path) => write!(f, "exact '{}'", path),
            RuleMatch::Prefix(prefix) => write!(f, "prefix '{}'", prefix),
            RuleMatch::Default => write!(f, "default"),
        }
    }
}

/// Resolves request paths to rules.
#[derive(Debug, Clone)]
pub struct RuleTable {
    exact: HashMap<String, Rule>,
    /// Sorted by prefix length, longest first
    prefixes: Vec<(String, Rule)>,
    default: Rule,
}

impl RuleTable {
    /// Build a table from a default rule and path entries.
    ///
    /// Fails if any rule is invalid or a path is configured twice with
    /// overlapping match kinds.
    pub fn new(default: Rule, entries: &[RuleConfig]) -> Result<Self> {
        default.validate()?;

        let mut exact = HashMap::new();
        let mut prefixes: Vec<(String, Rule)> = Vec::new();

        for entry in entries {
            let rule = entry.rule();
            rule.validate()
                .map_err(|e| VigilError::Config(format!("rule for '{}': {}", entry.path, e)))?;

            if matches!(entry.kind, PathMatch::Exact | PathMatch::Any)
                && exact.insert(entry.path.clone(), rule).is_some()
            {
                return Err(VigilError::Config(format!(
                    "duplicate exact rule for '{}'",
                    entry.path
                )));
            }

            if matches!(entry.kind, PathMatch::Prefix | PathMatch::Any) {
                if prefixes.iter().any(|(p, _)| p == &entry.path) {
                    return Err(VigilError::Config(format!(
                        "duplicate prefix rule for '{}'",
                        entry.path
                    )));
                }
                prefixes.push((entry.path.clone(), rule));
            }
        }

        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Self {
            exact,
            prefixes,
            default,
        })
    }

    /// Build a table from its serialized form.
    pub fn from_config(config: &RuleTableConfig) -> Result<Self> {
        Self::new(config.default, &config.rules)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RuleTableConfig = serde_yaml::from_str(yaml)
            .map_err(|e| VigilError::Config(format!("Failed to parse rule table: {}", e)))?;
        Self::from_config(&config)
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Find the rule for a request path.
    pub fn resolve(&self, path: &str) -> &Rule {
        self.lookup(path).0
    }

    /// Find the rule for a request path and report which entry matched.
    pub fn explain(&self, path: &str) -> (&Rule, RuleMatch<'_>) {
        self.lookup(path)
    }

    fn lookup(&self, path: &str) -> (&Rule, RuleMatch<'_>) {
        if let Some((configured, rule)) = self.exact.get_key_value(path) {
            return (rule, RuleMatch::Exact(configured));
        }

        if let Some((prefix, rule)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
        {
            return (rule, RuleMatch::Prefix(prefix));
        }

        (&self.default, RuleMatch::Default)
    }

    /// The fallback rule.
    pub fn default_rule(&self) -> &Rule {
        &self.default
    }

    /// Number of configured path entries (exact and prefix counted apart).
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    /// Whether only the default rule is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        let yaml = r#"
default:
  limit: 120
  window_secs: 60
rules:
  - path: /api/v1/auth/login
    limit: 5
    window_secs: 60
  - path: /api/v1/auth/
    limit: 20
    window_secs: 60
    match: prefix
"#;
        let table = RuleTable::from_yaml(yaml).unwrap();
        assert_eq!(table.default_rule(), &Rule::new(120, 60));
        assert_eq!(table.resolve("/api/v1/auth/login"), &Rule::new(5, 60));
        assert_eq!(table.resolve("/api/v1/auth/logout"), &Rule::new(20, 60));
    }

    #[test]
    fn test_exact_beats_prefix() {
        let table = RuleTable::new(
            Rule::new(120, 60),
            &[
                RuleConfig::new("/api/v1/users", 50, 60).with_match(PathMatch::Prefix),
                RuleConfig::new("/api/v1/users", 7, 60).with_match(PathMatch::Exact),
            ],
        )
        .unwrap();

        let (rule, matched) = table.explain("/api/v1/users");
        assert_eq!(rule.limit, 7);
        assert_eq!(matched, RuleMatch::Exact("/api/v1/users"));

        let (rule, matched) = table.explain("/api/v1/users/42");
        assert_eq!(rule.limit, 50);
        assert_eq!(matched, RuleMatch::Prefix("/api/v1/users"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RuleTable::new(
            Rule::new(120, 60),
            &[
                RuleConfig::new("/api/", 100, 60).with_match(PathMatch::Prefix),
                RuleConfig::new("/api/v1/auth/", 10, 60).with_match(PathMatch::Prefix),
            ],
        )
        .unwrap();

        assert_eq!(table.resolve("/api/v1/auth/refresh").limit, 10);
        assert_eq!(table.resolve("/api/v1/users").limit, 100);
    }

    #[test]
    fn test_prefix_beats_default() {
        let table = RuleTable::new(
            Rule::new(120, 60),
            &[RuleConfig::new("/api/v1/auth/change-password", 3, 60)],
        )
        .unwrap();

        assert_eq!(table.resolve("/api/v1/auth/change-password/confirm").limit, 3);
        let (rule, matched) = table.explain("/dashboard");
        assert_eq!(rule.limit, 120);
        assert_eq!(matched, RuleMatch::Default);
    }

    #[test]
    fn test_exact_only_rule_does_not_match_children() {
        let table = RuleTable::new(
            Rule::new(120, 60),
            &[RuleConfig::new("/api/v1/auth/login", 5, 60).with_match(PathMatch::Exact)],
        )
        .unwrap();

        assert_eq!(table.resolve("/api/v1/auth/login").limit, 5);
        assert_eq!(table.resolve("/api/v1/auth/login/sso").limit, 120);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(RuleTable::new(Rule::new(0, 60), &[]).is_err());
        assert!(RuleTable::new(Rule::new(10, 0), &[]).is_err());
        assert!(RuleTable::new(Rule::new(10, 60), &[RuleConfig::new("/x", 0, 60)]).is_err());
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let result = RuleTable::new(
            Rule::new(10, 60),
            &[RuleConfig::new("/x", 1, 60), RuleConfig::new("/x", 2, 60)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_default_is_parse_error() {
        let yaml = r#"
rules:
  - path: /api/v1/auth/login
    limit: 5
    window_secs: 60
"#;
        assert!(RuleTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_refill_rate() {
        let rule = Rule::new(5, 60);
        assert!((rule.refill_rate() - 0.083_333_333).abs() < 1e-6);
        assert_eq!(rule.window(), Duration::from_secs(60));
    }
}
