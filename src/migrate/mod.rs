mod migrator;
mod resources;

pub use migrator::SchemaMigrator;
pub use resources::{FilesystemResourceLoader, MemoryResourceLoader, ResourceLoader};

use crate::error::{DataError, DataResult};
use crate::shard::Shard;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A migration version within its namespace, the directory it was found in
/// relative to its root (`""` for the root itself). The path is not part of
/// the identity.
#[derive(Debug, Clone)]
pub struct NamespacedMigration {
    pub version: u64,
    pub namespace: String,
    pub path: String,
}

impl NamespacedMigration {
    pub fn new(version: u64, namespace: impl Into<String>) -> Self {
        Self {
            version,
            namespace: namespace.into(),
            path: String::new(),
        }
    }

    /// `1001` for the root namespace, `ns/1001` otherwise.
    pub fn namespaced_version(&self) -> String {
        format!("{}{}", self.namespace, self.version)
    }

    pub fn from_namespaced_version(value: &str) -> DataResult<Self> {
        let (namespace, version) = match value.rsplit_once('/') {
            Some((namespace, version)) => (format!("{namespace}/"), version),
            None => (String::new(), value),
        };
        let version = version
            .parse()
            .map_err(|_| DataError::Migration(format!("unexpected schema version: {value}")))?;
        Ok(Self::new(version, namespace))
    }

    /// Parses a resource path such as `migrations/ns/v1001__movies.sql`
    /// found under `root`.
    pub fn from_resource_path(resource: &str, root: &str) -> DataResult<Self> {
        let unexpected = || DataError::Migration(format!("unexpected resource: {resource}"));
        let (dir, file) = match resource.rfind('/') {
            Some(slash) => (&resource[..=slash], &resource[slash + 1..]),
            None => ("", resource),
        };
        let version = parse_file_name(file).ok_or_else(unexpected)?;
        let namespace = dir.strip_prefix(root).unwrap_or(dir);
        let namespace = namespace.strip_prefix('/').unwrap_or(namespace);
        Ok(Self {
            version,
            namespace: namespace.to_string(),
            path: resource.to_string(),
        })
    }
}

/// `v<digits>__<description>.sql`, returning the version.
fn parse_file_name(file: &str) -> Option<u64> {
    let rest = file.strip_prefix('v')?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let description = rest[digits..].strip_prefix("__")?;
    let description = description.strip_suffix(".sql")?;
    if description.is_empty() {
        return None;
    }
    rest[..digits].parse().ok()
}

impl PartialEq for NamespacedMigration {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NamespacedMigration {}

impl PartialOrd for NamespacedMigration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NamespacedMigration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then(self.version.cmp(&other.version))
    }
}

impl fmt::Display for NamespacedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespaced_version())
    }
}

fn render_set(set: &BTreeSet<NamespacedMigration>) -> String {
    let items = set.iter().map(ToString::to_string).collect::<Vec<_>>();
    format!("[{}]", items.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardMigrationState {
    pub available: BTreeSet<NamespacedMigration>,
    pub applied: BTreeSet<NamespacedMigration>,
}

impl ShardMigrationState {
    pub fn new(available: BTreeSet<NamespacedMigration>, applied: BTreeSet<NamespacedMigration>) -> Self {
        Self { available, applied }
    }

    /// Available but not applied, with their resource paths.
    pub fn missing(&self) -> BTreeSet<NamespacedMigration> {
        self.available.difference(&self.applied).cloned().collect()
    }

    pub fn untracked(&self) -> BTreeSet<NamespacedMigration> {
        self.applied.difference(&self.available).cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.available.is_subset(&self.applied)
    }
}

impl fmt::Display for ShardMigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.available == self.applied {
            write!(f, "(all {} migrations applied)", self.available.len())
        } else {
            write!(
                f,
                "(not applied={}, not tracked={})",
                render_set(&self.missing()),
                render_set(&self.untracked())
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationState {
    pub shards: BTreeMap<Shard, ShardMigrationState>,
}

impl MigrationState {
    pub fn is_complete(&self) -> bool {
        self.shards.values().all(ShardMigrationState::is_complete)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .shards
            .iter()
            .map(|(shard, state)| format!("{shard} {state}"))
            .collect::<Vec<_>>();
        f.write_str(&parts.join(", "))
    }
}
