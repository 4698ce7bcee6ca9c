//! Engine configuration and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bkt::BktParams;
use crate::dkt::DEFAULT_WEIGHT_SEED;

pub const DEFAULT_CONFIG_FILE: &str = "mastery-engine.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string. `DATABASE_URL` takes precedence when set.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub estimation: EstimationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// Parameters of the hybrid mastery estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationConfig {
    #[serde(default = "default_initial_mastery")]
    pub initial_mastery: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_guess")]
    pub guess: f64,
    #[serde(default = "default_slip")]
    pub slip: f64,
    /// Maximum number of past observations read per estimate.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// The sequence model joins the blend once history is longer than this.
    #[serde(default = "default_dkt_min_history")]
    pub dkt_min_history: usize,
    /// Share of the sequence model in the blended score.
    #[serde(default = "default_dkt_weight")]
    pub dkt_weight: f64,
    /// Score reported when estimation fails internally.
    #[serde(default = "default_fallback_score")]
    pub fallback_score: f64,
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
    #[serde(default = "default_weight_seed")]
    pub weight_seed: u64,
}

impl EstimationConfig {
    pub fn bkt_params(&self) -> BktParams {
        BktParams {
            initial: self.initial_mastery,
            learning_rate: self.learning_rate,
            guess: self.guess,
            slip: self.slip,
        }
    }
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            initial_mastery: default_initial_mastery(),
            learning_rate: default_learning_rate(),
            guess: default_guess(),
            slip: default_slip(),
            history_limit: default_history_limit(),
            dkt_min_history: default_dkt_min_history(),
            dkt_weight: default_dkt_weight(),
            fallback_score: default_fallback_score(),
            weights_path: None,
            weight_seed: default_weight_seed(),
        }
    }
}

/// Bounded exponential backoff for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn mastery() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }

    pub fn engagement() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent jobs per queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "RetryPolicy::mastery")]
    pub mastery: RetryPolicy,
    #[serde(default = "RetryPolicy::engagement")]
    pub engagement: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            mastery: RetryPolicy::mastery(),
            engagement: RetryPolicy::engagement(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_initial_mastery() -> f64 {
    0.1
}
fn default_learning_rate() -> f64 {
    0.3
}
fn default_guess() -> f64 {
    0.2
}
fn default_slip() -> f64 {
    0.1
}
fn default_history_limit() -> usize {
    50
}
fn default_dkt_min_history() -> usize {
    10
}
fn default_dkt_weight() -> f64 {
    0.7
}
fn default_fallback_score() -> f64 {
    50.0
}
fn default_weight_seed() -> u64 {
    DEFAULT_WEIGHT_SEED
}
fn default_workers() -> usize {
    4
}

/// Resolve `${VAR_NAME}` references from the environment.
/// Substituted values are not rescanned.
fn resolve_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        let var_name = &rest[start + 2..start + end];
        result.push_str(&rest[..start]);
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    result
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(content)?;
        config.database_url = config.database_url.as_deref().map(resolve_env_vars);
        config.estimation.weights_path = config
            .estimation
            .weights_path
            .as_ref()
            .map(|p| PathBuf::from(resolve_env_vars(&p.to_string_lossy())));
        Ok(config)
    }

    /// The database URL, preferring the `DATABASE_URL` environment variable.
    pub fn database_url(&self) -> Option<String> {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.database_url.clone().filter(|url| !url.is_empty()))
    }
}

/// Load from an explicit path, or `mastery-engine.toml` in the working
/// directory, or fall back to defaults.
pub fn load_config_from(path: Option<&Path>) -> Result<AppConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        }
    };

    match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            AppConfig::from_toml(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))
        }
        None => Ok(AppConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.estimation.history_limit, 50);
        assert_eq!(config.estimation.dkt_min_history, 10);
        assert_eq!(config.estimation.fallback_score, 50.0);
        assert_eq!(config.estimation.bkt_params(), BktParams::default());
        assert_eq!(config.dispatch.mastery, RetryPolicy::mastery());
        assert_eq!(config.dispatch.engagement, RetryPolicy::engagement());
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [estimation]
            slip = 0.05
            weights_path = "models/dkt.json"

            [dispatch]
            workers = 2

            [dispatch.mastery]
            max_attempts = 4
            initial_backoff_ms = 100
            max_backoff_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.estimation.slip, 0.05);
        assert_eq!(config.estimation.guess, 0.2);
        assert_eq!(
            config.estimation.weights_path.as_deref(),
            Some(Path::new("models/dkt.json"))
        );
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.dispatch.mastery.max_attempts, 4);
        assert_eq!(config.dispatch.engagement, RetryPolicy::engagement());
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 500,
            max_backoff_ms: 3_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3_000));
    }

    #[test]
    fn resolves_env_references() {
        std::env::set_var("MASTERY_ENGINE_TEST_HOST", "db.internal");
        assert_eq!(
            resolve_env_vars("postgres://${MASTERY_ENGINE_TEST_HOST}/school"),
            "postgres://db.internal/school"
        );
        assert_eq!(resolve_env_vars("no refs"), "no refs");
        assert_eq!(resolve_env_vars("open ${UNTERMINATED"), "open ${UNTERMINATED");
    }

    #[test]
    fn substituted_values_are_taken_literally() {
        std::env::set_var("MASTERY_ENGINE_TEST_NESTED", "p${ss}word");
        assert_eq!(
            resolve_env_vars(
                "postgres://app:${MASTERY_ENGINE_TEST_NESTED}@${MASTERY_ENGINE_TEST_UNSET}/school"
            ),
            "postgres://app:p${ss}word@/school"
        );
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config_from(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }
}
