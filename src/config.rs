use crate::error::{DataError, DataResult};
use crate::shard::{KeyRange, Keyspace, Shard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// One database holding every keyspace. Shard targeting is a no-op.
    #[default]
    Sqlite,
    ShardedSqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceConfig {
    pub name: String,
    #[serde(default)]
    pub sharded: bool,
    /// Shard ranges such as `-80` and `80-`. Unsharded keyspaces use `0`.
    #[serde(default)]
    pub shards: Vec<String>,
}

impl KeyspaceConfig {
    pub fn unsharded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sharded: false,
            shards: vec!["0".to_string()],
        }
    }

    pub fn sharded<I, S>(name: impl Into<String>, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            sharded: true,
            shards: ranges.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shard_list(&self) -> DataResult<Vec<Shard>> {
        let keyspace = Keyspace::new(self.name.as_str());
        if self.shards.is_empty() {
            return Ok(vec![Shard::new(keyspace, KeyRange::full())]);
        }
        self.shards
            .iter()
            .map(|r| Ok(Shard::new(keyspace.clone(), KeyRange::parse(r)?)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLimits {
    pub max_max_rows: usize,
    pub row_count_error_limit: usize,
    pub row_count_warning_limit: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_max_rows: 10_000,
            row_count_error_limit: 3_000,
            row_count_warning_limit: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSafetyConfig {
    pub cowrite: bool,
    pub full_scatter: bool,
    pub table_scan: bool,
}

impl Default for ScaleSafetyConfig {
    fn default() -> Self {
        Self {
            cowrite: true,
            full_scatter: true,
            table_scan: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            min_retry_delay_ms: 100,
            max_retry_delay_ms: 500,
            retry_jitter_ms: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub name: String,
    pub backend: BackendType,
    pub data_dir: PathBuf,
    pub keyspaces: Vec<KeyspaceConfig>,
    pub migrations: Vec<String>,
    /// Root holding one migration directory per keyspace.
    pub keyspace_migrations_root: Option<String>,
    pub query_limits: QueryLimits,
    pub checks: ScaleSafetyConfig,
    pub retry: RetryConfig,
    pub shard_cache_ttl_secs: u64,
    pub busy_timeout_ms: u64,
    pub pool_max_idle: usize,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            backend: BackendType::Sqlite,
            data_dir: PathBuf::from("data"),
            keyspaces: vec![KeyspaceConfig::unsharded("keyspace")],
            migrations: Vec::new(),
            keyspace_migrations_root: None,
            query_limits: QueryLimits::default(),
            checks: ScaleSafetyConfig::default(),
            retry: RetryConfig::default(),
            shard_cache_ttl_secs: 300,
            busy_timeout_ms: 5_000,
            pool_max_idle: 4,
        }
    }
}

impl DataSourceConfig {
    /// Single database in `dir`, every check enabled.
    pub fn development(dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// One database file per shard of every keyspace in `dir`.
    pub fn sharded(dir: impl AsRef<Path>, keyspaces: Vec<KeyspaceConfig>) -> Self {
        Self {
            backend: BackendType::ShardedSqlite,
            data_dir: dir.as_ref().to_path_buf(),
            keyspaces,
            ..Self::default()
        }
    }

    pub fn with_migrations<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.migrations = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keyspace_migrations_root(mut self, root: impl Into<String>) -> Self {
        self.keyspace_migrations_root = Some(root.into());
        self
    }

    pub fn from_json_str(json: &str) -> DataResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| DataError::InvalidConfig {
            message: format!("cannot parse data source config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> DataResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn shard_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.shard_cache_ttl_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn is_partitioned(&self) -> bool {
        self.backend == BackendType::ShardedSqlite
    }

    pub fn validate(&self) -> DataResult<()> {
        let invalid = |message: String| Err(DataError::InvalidConfig { message });
        if self.name.trim().is_empty() {
            return invalid("data source name must not be empty".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be > 0".into());
        }
        if self.retry.min_retry_delay_ms > self.retry.max_retry_delay_ms {
            return invalid(format!(
                "retry.min_retry_delay_ms ({}) exceeds retry.max_retry_delay_ms ({})",
                self.retry.min_retry_delay_ms, self.retry.max_retry_delay_ms
            ));
        }
        let limits = &self.query_limits;
        if limits.max_max_rows == 0 {
            return invalid("query_limits.max_max_rows must be > 0".into());
        }
        if limits.row_count_warning_limit > limits.row_count_error_limit {
            return invalid("query_limits.row_count_warning_limit exceeds row_count_error_limit".into());
        }
        if limits.row_count_error_limit > limits.max_max_rows {
            return invalid("query_limits.row_count_error_limit exceeds max_max_rows".into());
        }
        if self.keyspaces.is_empty() {
            return invalid("at least one keyspace must be configured".into());
        }
        let mut names = BTreeSet::new();
        for keyspace in &self.keyspaces {
            if !names.insert(keyspace.name.as_str()) {
                return invalid(format!("keyspace '{}' is configured twice", keyspace.name));
            }
            if keyspace.name.is_empty()
                || !keyspace
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return invalid(format!("keyspace name '{}' is not valid", keyspace.name));
            }
            if keyspace.sharded && keyspace.shards.is_empty() {
                return invalid(format!("sharded keyspace '{}' lists no shards", keyspace.name));
            }
            if !keyspace.sharded && keyspace.shards.len() > 1 {
                return invalid(format!(
                    "unsharded keyspace '{}' lists {} shards",
                    keyspace.name,
                    keyspace.shards.len()
                ));
            }
            keyspace.shard_list()?;
        }
        Ok(())
    }
}
