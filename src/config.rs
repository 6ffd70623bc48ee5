//! Configuration management for Vigil.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `VIGIL__`-prefixed environment variables (`VIGIL__BROADCAST__PACING_MS=250`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::ratelimit::{FaultPolicy, GuardSettings, Rule, RuleConfig, RuleTable};
use crate::schedule::{Schedule, TimeOfDay, TriggerConfig};

/// Main configuration for the Vigil service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP admission control settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Per-user bot command throttle settings
    #[serde(default)]
    pub command_throttle: CommandThrottleConfig,

    /// Scheduled broadcast settings
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-identity limit across all paths
    #[serde(default = "default_global_rule")]
    pub global: Rule,

    /// Rule for paths no entry matches
    #[serde(default = "default_path_rule")]
    pub default: Rule,

    /// Path-specific rules
    #[serde(default = "default_path_rules")]
    pub rules: Vec<RuleConfig>,

    /// Paths never limited
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Path prefixes never limited
    #[serde(default = "default_exempt_prefixes")]
    pub exempt_prefixes: Vec<String>,

    /// Behaviour when the limiter itself fails
    #[serde(default)]
    pub on_fault: FaultPolicy,

    /// Seconds between idle bucket sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds a bucket may sit idle before it is reclaimed
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: default_global_rule(),
            default: default_path_rule(),
            rules: default_path_rules(),
            exempt_paths: default_exempt_paths(),
            exempt_prefixes: default_exempt_prefixes(),
            on_fault: FaultPolicy::default(),
            sweep_interval_secs: default_sweep_interval(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl AdmissionConfig {
    /// Build the lookup table for path rules.
    pub fn rule_table(&self) -> Result<RuleTable> {
        RuleTable::new(self.default, &self.rules)
    }

    /// Guard settings derived from this section.
    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            enabled: self.enabled,
            exempt_paths: self.exempt_paths.clone(),
            exempt_prefixes: self.exempt_prefixes.clone(),
            on_fault: self.on_fault,
        }
    }

    /// Sweep period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Idle TTL as a `Duration`.
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_global_rule() -> Rule {
    Rule::new(300, 60)
}

fn default_path_rule() -> Rule {
    Rule::new(120, 60)
}

fn default_path_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig::new("/api/v1/auth/login", 5, 60),
        RuleConfig::new("/api/v1/auth/refresh", 10, 60),
        RuleConfig::new("/api/v1/auth/change-password", 3, 60),
    ]
}

fn default_exempt_paths() -> Vec<String> {
    GuardSettings::default().exempt_paths
}

fn default_exempt_prefixes() -> Vec<String> {
    GuardSettings::default().exempt_prefixes
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_ttl() -> u64 {
    600
}

/// Bot command throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandThrottleConfig {
    /// Disable in development to test commands freely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Calls allowed per period
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Period length in seconds
    #[serde(default = "default_period")]
    pub period_secs: u64,
}

impl Default for CommandThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_calls: default_max_calls(),
            period_secs: default_period(),
        }
    }
}

impl CommandThrottleConfig {
    /// Period as a `Duration`.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

fn default_max_calls() -> usize {
    5
}

fn default_period() -> u64 {
    60
}

/// How broadcast runs are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Fixed period, used in development
    Interval,
    /// Fixed local times of day
    #[default]
    Daily,
}

/// Schedule settings; only the fields relevant to `mode` are read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub mode: ScheduleMode,

    /// Period for `interval` mode
    #[serde(default = "default_every_secs")]
    pub every_secs: u64,

    /// Times of day for `daily` mode
    #[serde(default = "default_daily_times")]
    pub times: Vec<TimeOfDay>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            every_secs: default_every_secs(),
            times: default_daily_times(),
        }
    }
}

impl ScheduleConfig {
    /// The schedule this section describes.
    pub fn schedule(&self) -> Schedule {
        match self.mode {
            ScheduleMode::Interval => Schedule::Interval {
                every: Duration::from_secs(self.every_secs),
            },
            ScheduleMode::Daily => Schedule::Daily {
                times: self.times.clone(),
            },
        }
    }
}

fn default_every_secs() -> u64 {
    120
}

fn default_daily_times() -> Vec<TimeOfDay> {
    [(9, 0), (15, 0), (21, 0)]
        .into_iter()
        .filter_map(|(hour, minute)| TimeOfDay::new(hour, minute).ok())
        .collect()
}

/// Broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Text sent to every recipient
    #[serde(default = "default_message")]
    pub message: String,

    /// Delay between consecutive sends, in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// When runs fire
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Collapse missed ticks into one run
    #[serde(default = "default_true")]
    pub coalesce: bool,

    /// Runs allowed in flight at once
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// YAML roster for the in-memory directory
    #[serde(default)]
    pub recipients_file: Option<PathBuf>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            message: default_message(),
            pacing_ms: default_pacing_ms(),
            schedule: ScheduleConfig::default(),
            coalesce: true,
            max_concurrent_runs: default_max_concurrent_runs(),
            recipients_file: None,
        }
    }
}

impl BroadcastConfig {
    /// Pacing as a `Duration`.
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Trigger settings for the broadcast job.
    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            schedule: self.schedule.schedule(),
            coalesce: self.coalesce,
            max_concurrent_runs: self.max_concurrent_runs,
        }
    }
}

fn default_message() -> String {
    "Time to record your readings. Open the menu and tap \"Add measurement\".".to_string()
}

fn default_pacing_ms() -> u64 {
    500
}

fn default_max_concurrent_runs() -> usize {
    1
}

impl VigilConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .separator("__")
                .try_parsing(true),
        );

        let config: VigilConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: VigilConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.admission.global.validate()?;
        self.admission.rule_table()?;

        if self.admission.sweep_interval_secs == 0 {
            return Err(VigilError::Config(
                "admission.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.command_throttle.max_calls == 0 || self.command_throttle.period_secs == 0 {
            return Err(VigilError::Config(
                "command_throttle needs max_calls and period_secs of at least 1".to_string(),
            ));
        }
        if self.broadcast.max_concurrent_runs == 0 {
            return Err(VigilError::Config(
                "broadcast.max_concurrent_runs must be at least 1".to_string(),
            ));
        }
        self.broadcast.schedule.schedule().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VigilConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.admission.global, Rule::new(300, 60));
        assert_eq!(config.admission.default, Rule::new(120, 60));
        assert_eq!(config.command_throttle.max_calls, 5);
        assert_eq!(config.broadcast.pacing(), Duration::from_millis(500));

        let trigger = config.broadcast.trigger_config();
        assert!(trigger.coalesce);
        assert_eq!(trigger.max_concurrent_runs, 1);
        assert_eq!(trigger.schedule.to_string(), "daily at 09:00, 15:00, 21:00");
        assert_eq!(config.broadcast.schedule.times.len(), 3);
    }

    #[test]
    fn test_default_rule_table() {
        let table = VigilConfig::default().admission.rule_table().unwrap();
        assert_eq!(*table.resolve("/api/v1/auth/login"), Rule::new(5, 60));
        assert_eq!(*table.resolve("/api/v1/auth/refresh"), Rule::new(10, 60));
        assert_eq!(*table.resolve("/api/v1/auth/change-password"), Rule::new(3, 60));
        assert_eq!(*table.resolve("/api/v1/patients"), Rule::new(120, 60));
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = VigilConfig::from_yaml(
            r#"
logging:
  format: json
admission:
  on_fault: deny
  rules:
    - path: /api/v1/export/
      limit: 2
      window_secs: 60
      match: prefix
broadcast:
  pacing_ms: 100
  schedule:
    mode: interval
    every_secs: 120
"#,
        )
        .unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.admission.on_fault, FaultPolicy::Deny);
        assert_eq!(config.admission.rules.len(), 1);
        assert_eq!(config.admission.global, Rule::new(300, 60));
        assert_eq!(
            config.broadcast.trigger_config().schedule,
            Schedule::Interval {
                every: Duration::from_secs(120)
            }
        );
    }

    #[test]
    fn test_daily_times_from_yaml() {
        let config = VigilConfig::from_yaml(
            r#"
broadcast:
  schedule:
    times: ["08:30", "20:00"]
"#,
        )
        .unwrap();

        assert_eq!(
            config.broadcast.schedule.times,
            vec![TimeOfDay::new(8, 30).unwrap(), TimeOfDay::new(20, 0).unwrap()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(VigilConfig::from_yaml("admission:\n  global:\n    limit: 0\n    window_secs: 60\n").is_err());
        assert!(VigilConfig::from_yaml("broadcast:\n  max_concurrent_runs: 0\n").is_err());
        assert!(VigilConfig::from_yaml("broadcast:\n  schedule:\n    mode: interval\n    every_secs: 0\n").is_err());
        assert!(VigilConfig::from_yaml("broadcast:\n  schedule:\n    times: [\"25:00\"]\n").is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("vigil-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "command_throttle:\n  period_secs: 30\n").unwrap();
        std::env::set_var("VIGIL__COMMAND_THROTTLE__ENABLED", "false");

        let config = VigilConfig::load(Some(&path)).unwrap();
        std::env::remove_var("VIGIL__COMMAND_THROTTLE__ENABLED");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.command_throttle.period_secs, 30);
        assert!(!config.command_throttle.enabled);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("vigil-does-not-exist.yaml");
        assert!(VigilConfig::load(Some(&path)).is_err());
    }
}
