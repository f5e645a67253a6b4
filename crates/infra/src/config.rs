//! Pipeline settings.
//!
//! Resolution order, highest first:
//! 1. Explicit path / values from the command line
//! 2. Environment variables (`DATABASE_URL`, `FHIRMAT_*`)
//! 3. TOML config file (`--config` or `FHIRMAT_CONFIG`)
//! 4. Compiled defaults

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handlers::WorkerTopology;
use crate::jobs::{BackoffStrategy, JobRetention, RetryPolicy, WorkerConfig, topics};
use crate::resources::{
    CatalogError, DeclaredResource, DeclaredResourceSpec, ResourceCatalog, ResourceDefinition,
};

pub const CONFIG_PATH_ENV: &str = "FHIRMAT_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Claims older than this are released by the stale-claim sweep.
    pub claim_timeout_secs: u64,
    /// `0` disables the per-job timeout.
    pub job_timeout_secs: u64,
    pub topology: WorkerTopology,
    pub retention: JobRetention,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 100,
            poll_interval_ms: 1000,
            claim_timeout_secs: 600,
            job_timeout_secs: 300,
            topology: WorkerTopology::All,
            retention: JobRetention::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverSettings {
    /// Wait before a resolver job runs, so a burst of materialisations can land.
    pub delay_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self { delay_ms: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            ..RetryPolicy::default()
        }
    }
}

/// Everything the pipeline reads at runtime. Immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FhirSettings {
    pub database_url: Option<String>,
    pub worker: WorkerSettings,
    pub resolver: ResolverSettings,
    pub reconciler: ReconcilerSettings,
    /// Topic → retry policy. Topics not listed never retry.
    pub retry: BTreeMap<String, RetrySettings>,
    /// Config-declared resources, see [`DeclaredResource`].
    pub resources: Vec<DeclaredResourceSpec>,
    /// Free-form key/value lookups for resource definitions.
    pub values: BTreeMap<String, String>,
}

impl FhirSettings {
    /// Load from `path` (or `FHIRMAT_CONFIG`), then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment-style lookups.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        override_parsed(&lookup, "FHIRMAT_WORKER_ENABLED", &mut self.worker.enabled)?;
        override_parsed(&lookup, "FHIRMAT_WORKER_CONCURRENCY", &mut self.worker.concurrency)?;
        override_parsed(&lookup, "FHIRMAT_WORKER_POLL_INTERVAL_MS", &mut self.worker.poll_interval_ms)?;
        override_parsed(&lookup, "FHIRMAT_WORKER_TOPOLOGY", &mut self.worker.topology)?;
        override_parsed(&lookup, "FHIRMAT_CLAIM_TIMEOUT_SECS", &mut self.worker.claim_timeout_secs)?;
        override_parsed(&lookup, "FHIRMAT_JOB_TIMEOUT_SECS", &mut self.worker.job_timeout_secs)?;
        override_parsed(&lookup, "FHIRMAT_RESOLVER_DELAY_MS", &mut self.resolver.delay_ms)?;
        override_parsed(&lookup, "FHIRMAT_RECONCILER_ENABLED", &mut self.reconciler.enabled)?;
        override_parsed(&lookup, "FHIRMAT_RECONCILER_INTERVAL_SECS", &mut self.reconciler.interval_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be at least 1".into()));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("worker.poll_interval_ms must be positive".into()));
        }
        if self.worker.job_timeout_secs > 0 && self.worker.claim_timeout_secs <= self.worker.job_timeout_secs {
            return Err(ConfigError::Invalid(
                "worker.claim_timeout_secs must exceed worker.job_timeout_secs".into(),
            ));
        }
        if self.reconciler.enabled && self.reconciler.interval_secs == 0 {
            return Err(ConfigError::Invalid("reconciler.interval_secs must be positive".into()));
        }
        if let Some((topic, _)) = self.retry.iter().find(|(_, r)| r.max_attempts == 0) {
            return Err(ConfigError::Invalid(format!(
                "retry.{topic}.max_attempts must be at least 1"
            )));
        }
        Ok(())
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn value_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(|v| v.parse().ok())
    }

    pub fn resolver_delay(&self) -> Duration {
        Duration::from_millis(self.resolver.delay_ms)
    }

    pub fn reconciler_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.interval_secs)
    }

    pub fn worker_config(&self, name: impl Into<String>) -> WorkerConfig {
        let job_timeout = (self.worker.job_timeout_secs > 0)
            .then(|| Duration::from_secs(self.worker.job_timeout_secs));
        WorkerConfig::default()
            .with_name(name)
            .with_concurrency(self.worker.concurrency)
            .with_poll_interval(Duration::from_millis(self.worker.poll_interval_ms))
            .with_claim_timeout(Some(Duration::from_secs(self.worker.claim_timeout_secs)))
            .with_job_timeout(job_timeout)
    }

    /// Configured policy for `topic`. The resolver retries by default since
    /// a pass can commit with rows deferred for the next one.
    pub fn retry_policy(&self, topic: &str) -> Option<RetryPolicy> {
        match self.retry.get(topic) {
            Some(settings) => Some(settings.to_policy()),
            None if topic == topics::RESOLVER => Some(default_resolver_retry()),
            None => None,
        }
    }

    /// Build the catalogue from the declared resources plus `extra`
    /// definitions supplied in code.
    pub fn catalog(
        &self,
        extra: Vec<Arc<dyn ResourceDefinition>>,
    ) -> Result<ResourceCatalog, ConfigError> {
        let mut defs = extra;
        for spec in &self.resources {
            let def = DeclaredResource::from_spec(spec.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            defs.push(Arc::new(def));
        }
        Ok(ResourceCatalog::new(defs)?)
    }
}

fn default_resolver_retry() -> RetryPolicy {
    RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60))
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let settings = FhirSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.resolver_delay(), Duration::from_secs(5));
        assert_eq!(settings.worker.concurrency, 100);
        assert_eq!(settings.worker.retention, JobRetention::Delete);
    }

    #[test]
    fn parses_full_toml() {
        let settings = FhirSettings::from_toml(
            r#"
            [worker]
            concurrency = 8
            topology = "resolver"
            retention = "keep"

            [resolver]
            delay_ms = 250

            [retry."fhir.refresh.fromUpstream"]
            max_attempts = 3
            strategy = "fixed"

            [values]
            "fhir.worker.batchLimit" = "50"

            [[resources]]
            name = "Patient"
            upstreams = ["patients"]
            fields = { gender = "sex" }
            "#,
        )
        .unwrap();

        assert_eq!(settings.worker.concurrency, 8);
        assert_eq!(settings.worker.topology, WorkerTopology::Resolver);
        assert_eq!(settings.worker.retention, JobRetention::Keep);
        assert_eq!(settings.resolver.delay_ms, 250);
        assert_eq!(settings.value_as::<u32>("fhir.worker.batchLimit"), Some(50));

        let policy = settings.retry_policy("fhir.refresh.fromUpstream").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
        assert!(settings.retry_policy("fhir.refresh.entireResource").is_none());

        let resolver = settings.retry_policy("fhir.resolver").unwrap();
        assert_eq!(resolver.max_attempts, 5);
        assert_eq!(resolver.strategy, BackoffStrategy::Exponential);

        let catalog = settings.catalog(vec![]).unwrap();
        assert_eq!(catalog.names(), ["Patient"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FhirSettings::from_toml("[worker]\nthreads = 4\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut settings = FhirSettings::from_toml("[worker]\nconcurrency = 8\n").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("FHIRMAT_WORKER_CONCURRENCY", "16"),
            ("FHIRMAT_WORKER_TOPOLOGY", "refresh"),
            ("DATABASE_URL", "postgres://localhost/fhir"),
        ]);
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.worker.concurrency, 16);
        assert_eq!(settings.worker.topology, WorkerTopology::Refresh);
        assert_eq!(settings.database_url.as_deref(), Some("postgres://localhost/fhir"));
    }

    #[test]
    fn malformed_env_value_names_the_key() {
        let mut settings = FhirSettings::default();
        let err = settings
            .apply_env(|key| (key == "FHIRMAT_RESOLVER_DELAY_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("FHIRMAT_RESOLVER_DELAY_MS"));
    }

    #[test]
    fn claim_timeout_must_outlast_job_timeout() {
        let mut settings = FhirSettings::default();
        settings.worker.claim_timeout_secs = 60;
        settings.worker.job_timeout_secs = 300;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        settings.worker.job_timeout_secs = 0;
        settings.validate().unwrap();
        assert_eq!(settings.worker_config("w").job_timeout, None);
    }
}
