//! Provider configuration structures.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{PoolSettings, ProviderError, RestartPolicy, RetryPolicy, SupervisorOptions};

/// Downstream API used when nothing else is configured.
pub const DEFAULT_API_URL: &str = "https://api.anyfetch.com";

/// Retry settings of task jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub delay_ms: u64,
    /// Double the delay on every further retry.
    pub exponential: bool,
    /// Per-attempt timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1_000,
            exponential: false,
            timeout_ms: 60_000,
        }
    }
}

/// Token cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries.
    pub capacity: usize,
    /// Entry lifetime, in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            ttl_secs: 3_600,
        }
    }
}

/// Respawn limits of crashed workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Pause before relaunching, in milliseconds.
    pub backoff_ms: u64,
    /// Consecutive crashes tolerated; unbounded when absent.
    pub max_consecutive: Option<u32>,
}

/// Command that starts one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable path.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    /// Command without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Root provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Prefix of every account queue name.
    pub app_name: String,
    /// Downstream API base URL.
    pub api_url: String,
    /// Worker processes per account pool.
    pub workers_per_account: usize,
    /// Jobs each worker process runs at once.
    pub concurrency: usize,
    /// Worker sleep between polls of an empty queue, in milliseconds.
    pub idle_poll_ms: u64,
    /// Age after which an update lock counts as abandoned, in seconds.
    pub stale_lock_secs: u64,
    /// Timeout of a whole update cycle, in seconds.
    pub update_timeout_secs: u64,
    /// Retry settings of task jobs.
    pub retry: RetryConfig,
    /// Token cache settings.
    pub cache: CacheConfig,
    /// Lifetime of connection handshake codes, in seconds.
    pub temp_token_ttl_secs: u64,
    /// Time a worker gets to honor an exit request, in milliseconds.
    pub kill_grace_ms: u64,
    /// Respawn limits.
    pub restart: RestartConfig,
    /// Worker process command. Required when workers run out of process.
    pub worker: Option<WorkerCommand>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            app_name: "document-provider".into(),
            api_url: DEFAULT_API_URL.into(),
            workers_per_account: 1,
            concurrency: 1,
            idle_poll_ms: 250,
            stale_lock_secs: 5 * 3_600,
            update_timeout_secs: 3_600,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            temp_token_ttl_secs: 600,
            kill_grace_ms: 5_000,
            restart: RestartConfig::default(),
            worker: None,
        }
    }
}

impl ProviderConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let invalid = |msg: &str| Err(ProviderError::InvalidConfig(msg.into()));
        if self.app_name.trim().is_empty() {
            return invalid("app_name must not be empty");
        }
        if self.api_url.trim().is_empty() {
            return invalid("api_url must not be empty");
        }
        if self.workers_per_account == 0 {
            return invalid("workers_per_account must be greater than 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if self.idle_poll_ms == 0 {
            return invalid("idle_poll_ms must be greater than 0");
        }
        if self.stale_lock_secs == 0 {
            return invalid("stale_lock_secs must be greater than 0");
        }
        if self.update_timeout_secs == 0 {
            return invalid("update_timeout_secs must be greater than 0");
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be greater than 0");
        }
        if self.retry.timeout_ms == 0 {
            return invalid("retry.timeout_ms must be greater than 0");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be greater than 0");
        }
        if let Some(worker) = &self.worker {
            if worker.program.trim().is_empty() {
                return invalid("worker.program must not be empty");
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, ProviderError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|e| ProviderError::InvalidConfig(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, starts from the JSON file named by
    /// `PROVIDER_CONFIG` (defaults otherwise), then applies `PROVIDER_*`
    /// overrides.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when the file or an override cannot be parsed, or the
    /// result does not validate.
    pub fn from_env() -> Result<Self, ProviderError> {
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var("PROVIDER_CONFIG") {
            Ok(path) => Self::read_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn read_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::InvalidConfig(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ProviderError::InvalidConfig(format!("parse error: {e}")))
    }

    /// Apply `PROVIDER_*` overrides read through `lookup`.
    ///
    /// `API_URL` is honored as a fallback for `PROVIDER_API_URL`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when a numeric override does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ProviderError> {
        if let Some(v) = lookup("PROVIDER_APP_NAME") {
            self.app_name = v;
        }
        if let Some(v) = lookup("PROVIDER_API_URL").or_else(|| lookup("API_URL")) {
            self.api_url = v;
        }
        if let Some(v) = lookup("PROVIDER_WORKERS") {
            self.workers_per_account = parse_override("PROVIDER_WORKERS", &v)?;
        }
        if let Some(v) = lookup("PROVIDER_CONCURRENCY") {
            self.concurrency = parse_override("PROVIDER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("PROVIDER_STALE_LOCK_SECS") {
            self.stale_lock_secs = parse_override("PROVIDER_STALE_LOCK_SECS", &v)?;
        }
        if let Some(v) = lookup("PROVIDER_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_override("PROVIDER_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PROVIDER_WORKER_PROGRAM") {
            let mut worker = self.worker.take().unwrap_or_else(|| WorkerCommand::new(String::new()));
            worker.program = v;
            self.worker = Some(worker);
        }
        Ok(())
    }

    /// Lock age after which a forced restart is allowed.
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    /// Token cache entry lifetime.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    /// Handshake code lifetime.
    #[must_use]
    pub const fn temp_token_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_token_ttl_secs)
    }

    /// Policy of task jobs.
    #[must_use]
    pub const fn task_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            delay_ms: self.retry.delay_ms,
            exponential: self.retry.exponential,
            timeout_ms: self.retry.timeout_ms,
        }
    }

    /// Policy of update jobs: one attempt, retried through stale-lock detection.
    #[must_use]
    pub fn update_policy(&self) -> RetryPolicy {
        RetryPolicy::once(Duration::from_secs(self.update_timeout_secs))
    }

    /// Settings shared by every account pool.
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            app_name: self.app_name.clone(),
            api_url: self.api_url.clone(),
            concurrency: self.concurrency,
            idle_poll_ms: self.idle_poll_ms,
            task_policy: self.task_policy(),
            supervisor: SupervisorOptions {
                workers: self.workers_per_account,
                kill_grace: Duration::from_millis(self.kill_grace_ms),
                restart: RestartPolicy {
                    backoff: Duration::from_millis(self.restart.backoff_ms),
                    max_consecutive: self.restart.max_consecutive,
                },
            },
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ProviderError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ProviderError::InvalidConfig(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ProviderConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.api_url, "https://api.anyfetch.com");
        assert_eq!(cfg.stale_threshold(), Duration::from_secs(5 * 3600));
        assert_eq!(cfg.cache.capacity, 50);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.temp_token_ttl(), Duration::from_secs(600));
        assert_eq!(cfg.update_policy().attempts, 1);
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PROVIDER_WORKERS", "4"),
            ("API_URL", "http://localhost:8000"),
            ("PROVIDER_WORKER_PROGRAM", "/usr/bin/worker"),
        ]);
        let mut cfg = ProviderConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(cfg.workers_per_account, 4);
        assert_eq!(cfg.api_url, "http://localhost:8000");
        assert_eq!(cfg.worker.unwrap().program, "/usr/bin/worker");

        let err = ProviderConfig::default()
            .apply_overrides(|k| (k == "PROVIDER_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidConfig(msg) if msg.starts_with("PROVIDER_CONCURRENCY")));
    }

    #[test]
    fn pool_settings_name_queues_by_account() {
        let mut cfg = ProviderConfig::default();
        cfg.app_name = "dropbox".into();
        assert_eq!(cfg.pool_settings().queue_name("alice@example.com"), "dropbox:alice@example.com");
    }
}
