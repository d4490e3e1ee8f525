//! Engine configuration.
//!
//! One record per component, every field defaulted, loadable from YAML and
//! overridable from `STENCIL_*` environment variables. `validate()` runs once
//! when the engine is constructed.

use crate::cache::StrategyKind;
use crate::error::ConfigError;
use crate::types::OptimizationLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    /// Directory template paths are resolved against.
    pub templates_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            templates_root: PathBuf::from("templates"),
        }
    }
}

/// Compiler and optimizer settings. Serialized into every compiled-template
/// cache key, so any change here invalidates compiled artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub optimization_level: OptimizationLevel,
    /// Largest include target (in nodes) the inlining pass will splice in.
    pub inline_threshold: usize,
    /// Threshold multiplier used by aggressive inlining at `Maximum`.
    pub aggressive_inline_multiplier: usize,
    /// Loops with a known bound above this are left intact.
    pub max_unroll_iterations: u64,
    /// Templates whose complexity is below this skip passes above `Basic`.
    pub advanced_complexity_floor: u32,
    /// Executions before a template is promoted to the specialized tier.
    pub tiering_threshold: u64,
    /// Nesting limit for runtime includes and imported macro calls.
    pub max_include_depth: usize,
    /// Compile-time values for `_`-prefixed (private) variables.
    pub globals: BTreeMap<String, serde_json::Value>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::Basic,
            inline_threshold: 32,
            aggressive_inline_multiplier: 4,
            max_unroll_iterations: 10,
            advanced_complexity_floor: 8,
            tiering_threshold: 100,
            max_include_depth: 16,
            globals: BTreeMap::new(),
        }
    }
}

/// Cache engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub strategy: StrategyKind,
    /// Memory ceiling for the in-memory tier.
    pub max_memory_bytes: usize,
    pub max_entries: usize,
    /// TTL applied to entries stored without one. `None` = no expiry.
    pub default_ttl_ms: Option<u64>,
    pub gc_interval_ms: u64,
    /// Share of entries evicted by a GC sweep under memory pressure.
    pub gc_evict_percent: u8,
    /// Fraction of `max_memory_bytes` above which GC starts evicting.
    pub gc_trigger_ratio: f64,
    /// Average hit count above which the adaptive strategy orders by frequency.
    pub adaptive_lfu_threshold: f64,
    /// Directory for the persisted blob tier. `None` disables the tier.
    pub persist_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Lru,
            max_memory_bytes: 64 * 1024 * 1024,
            max_entries: 10_000,
            default_ttl_ms: None,
            gc_interval_ms: 60_000,
            gc_evict_percent: 10,
            gc_trigger_ratio: 0.9,
            adaptive_lfu_threshold: 3.0,
            persist_dir: None,
        }
    }
}

/// Incremental scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs running at once within one priority group.
    pub concurrency_limit: usize,
    /// When false, jobs in a group run one after another.
    pub parallel: bool,
    /// How far dependents are followed when computing the affected set.
    pub max_dependent_depth: usize,
    /// Dependent count at which impact becomes `High`.
    pub high_fan_out: usize,
    /// Dependent count at which impact becomes `Critical`.
    pub critical_fan_out: usize,
    /// Persisted scheduler state document.
    pub state_file: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            parallel: true,
            max_dependent_depth: 16,
            high_fan_out: 5,
            critical_fan_out: 20,
            state_file: PathBuf::from(".stencil/state.json"),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading engine configuration from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `STENCIL_*` overrides from an explicit variable list.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "STENCIL_OPT_LEVEL" => {
                    self.compiler.optimization_level =
                        value.parse().map_err(|message| ConfigError::Invalid {
                            field: "compiler.optimization_level",
                            message,
                        })?;
                }
                "STENCIL_CONCURRENCY" => {
                    self.scheduler.concurrency_limit =
                        parse_number(value, "scheduler.concurrency_limit")?;
                }
                "STENCIL_PARALLEL" => {
                    self.scheduler.parallel = matches!(value, "1" | "true" | "yes");
                }
                "STENCIL_CACHE_MAX_BYTES" => {
                    self.cache.max_memory_bytes = parse_number(value, "cache.max_memory_bytes")?;
                }
                "STENCIL_CACHE_DIR" => {
                    self.cache.persist_dir = Some(PathBuf::from(value));
                }
                "STENCIL_TEMPLATES_ROOT" => {
                    self.templates_root = PathBuf::from(value);
                }
                "STENCIL_STATE_FILE" => {
                    self.scheduler.state_file = PathBuf::from(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, message: &str| {
            Err(ConfigError::Invalid {
                field,
                message: message.to_string(),
            })
        };

        if self.cache.max_memory_bytes == 0 {
            return invalid("cache.max_memory_bytes", "must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries", "must be greater than zero");
        }
        if self.cache.gc_evict_percent == 0 || self.cache.gc_evict_percent > 100 {
            return invalid("cache.gc_evict_percent", "must be within 1..=100");
        }
        if !(self.cache.gc_trigger_ratio > 0.0 && self.cache.gc_trigger_ratio <= 1.0) {
            return invalid("cache.gc_trigger_ratio", "must be within (0, 1]");
        }
        if self.cache.gc_interval_ms == 0 {
            return invalid("cache.gc_interval_ms", "must be greater than zero");
        }
        if self.scheduler.concurrency_limit == 0 {
            return invalid("scheduler.concurrency_limit", "must be at least 1");
        }
        if self.scheduler.high_fan_out >= self.scheduler.critical_fan_out {
            return invalid(
                "scheduler.high_fan_out",
                "must be below scheduler.critical_fan_out",
            );
        }
        if self.compiler.aggressive_inline_multiplier == 0 {
            return invalid("compiler.aggressive_inline_multiplier", "must be at least 1");
        }
        if self.compiler.max_include_depth == 0 {
            return invalid("compiler.max_include_depth", "must be at least 1");
        }
        if let Some(bad) = self.compiler.globals.keys().find(|k| !k.starts_with('_')) {
            return Err(ConfigError::Invalid {
                field: "compiler.globals",
                message: format!("global '{bad}' must start with '_'"),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        message: format!("'{value}' is not a number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.compiler.optimization_level, OptimizationLevel::Basic);
        assert_eq!(config.scheduler.concurrency_limit, 4);
        assert_eq!(config.cache.strategy, StrategyKind::Lru);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
compiler:
  optimization_level: advanced
  globals:
    _site: "Example"
cache:
  strategy: adaptive
  max_memory_bytes: 2048
"#,
        )
        .unwrap();
        assert_eq!(config.compiler.optimization_level, OptimizationLevel::Advanced);
        assert_eq!(config.compiler.max_unroll_iterations, 10);
        assert_eq!(config.cache.strategy, StrategyKind::Adaptive);
        assert_eq!(config.cache.max_memory_bytes, 2048);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides([
                ("STENCIL_OPT_LEVEL", "maximum"),
                ("STENCIL_CONCURRENCY", "8"),
                ("STENCIL_PARALLEL", "false"),
                ("UNRELATED", "x"),
            ])
            .unwrap();
        assert_eq!(config.compiler.optimization_level, OptimizationLevel::Maximum);
        assert_eq!(config.scheduler.concurrency_limit, 8);
        assert!(!config.scheduler.parallel);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides([("STENCIL_CONCURRENCY", "many")])
            .unwrap_err();
        assert!(err.to_string().contains("scheduler.concurrency_limit"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = EngineConfig::default();
        config.cache.gc_evict_percent = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.compiler.globals.insert("site".into(), serde_json::json!("x"));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scheduler.high_fan_out = 30;
        assert!(config.validate().is_err());
    }
}
