use super::{MigrationState, NamespacedMigration, ResourceLoader, ShardMigrationState};
use crate::checks::{Check, MIGRATION_TABLE};
use crate::context::CallContext;
use crate::error::{DataError, DataResult};
use crate::shard::{Keyspace, Shard};
use crate::transacter::Transacter;
use crate::types::{Value, text_at};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const CREATE_MIGRATION_TABLE: &str = "CREATE TABLE schema_version (
  version varchar(50) PRIMARY KEY,
  installed_by varchar(30) DEFAULT NULL
);";

const RECORD_MIGRATION: &str = "INSERT INTO schema_version (version, installed_by) VALUES (?, ?)";

/// Tracks available and applied schema migrations per shard.
pub struct SchemaMigrator {
    transacter: Transacter,
    loader: Arc<dyn ResourceLoader>,
}

impl SchemaMigrator {
    pub fn new(transacter: Transacter, loader: Arc<dyn ResourceLoader>) -> Self {
        Self { transacter, loader }
    }

    fn name(&self) -> &str {
        &self.transacter.config().name
    }

    fn context(&self) -> CallContext {
        CallContext::new(format!("{}-schema-migrator", self.name()))
    }

    pub fn migration_roots(&self, keyspace: &Keyspace) -> Vec<String> {
        let config = self.transacter.config();
        let mut roots = config.migrations.clone();
        if let Some(root) = &config.keyspace_migrations_root {
            let root = root.trim_end_matches('/');
            if self.transacter.is_partitioned() {
                roots.push(format!("{root}/{}", keyspace.name()));
            } else {
                // Every keyspace shares the one database.
                roots.extend(config.keyspaces.iter().map(|k| format!("{root}/{}", k.name)));
            }
        }
        roots
    }

    pub fn available_migrations(&self, keyspace: &Keyspace) -> DataResult<BTreeSet<NamespacedMigration>> {
        let mut found = Vec::new();
        for root in self.migration_roots(keyspace) {
            let root = root.trim_end_matches('/');
            for path in self.loader.walk(root) {
                if path.ends_with(".sql") {
                    found.push(NamespacedMigration::from_resource_path(&path, root)?);
                }
            }
        }
        let available: BTreeSet<_> = found.iter().cloned().collect();
        if available.len() != found.len() {
            let mut paths = found
                .iter()
                .filter(|m| found.iter().filter(|other| other == m).count() > 1)
                .map(|m| m.path.clone())
                .collect::<Vec<_>>();
            paths.sort();
            return Err(DataError::DuplicateMigrations { paths });
        }
        Ok(available)
    }

    /// Creates the bookkeeping table where it is missing and returns what
    /// every shard has applied.
    pub fn initialize(&self) -> DataResult<BTreeSet<NamespacedMigration>> {
        let shards = self.transacter.shards()?;
        if shards
            .iter()
            .all(|shard| self.migration_roots(&shard.keyspace).is_empty())
        {
            return Ok(BTreeSet::new());
        }
        let mut applied = BTreeSet::new();
        for shard in shards.iter() {
            applied.extend(self.initialize_shard(shard)?);
        }
        Ok(applied)
    }

    pub fn initialize_shard(&self, shard: &Shard) -> DataResult<BTreeSet<NamespacedMigration>> {
        if self.has_migration_table(shard)? {
            let applied = self.applied_migrations(shard)?;
            info!(
                name = self.name(),
                %shard,
                applied = applied.len(),
                latest = ?applied.last().map(ToString::to_string),
                "migrations applied"
            );
            return Ok(applied);
        }
        self.transacter
            .transaction_on_shard(&self.context(), shard, |session| {
                session.use_connection(|c| c.execute_batch(CREATE_MIGRATION_TABLE))
            })?;
        info!(name = self.name(), %shard, "created {MIGRATION_TABLE} table");
        Ok(BTreeSet::new())
    }

    fn has_migration_table(&self, shard: &Shard) -> DataResult<bool> {
        let rows = self
            .transacter
            .read_only()
            .transaction_on_shard(&self.context(), shard, |session| {
                session.use_connection(|c| {
                    c.query(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                        &[Value::from(MIGRATION_TABLE)],
                    )
                })
            })?;
        Ok(!rows.is_empty())
    }

    /// Versions recorded in the bookkeeping table. Fails if it does not exist.
    pub fn applied_migrations(&self, shard: &Shard) -> DataResult<BTreeSet<NamespacedMigration>> {
        let rows = self
            .transacter
            .read_only()
            .transaction_on_shard(&self.context(), shard, |session| {
                session.disable_checks(&[Check::TableScan], |session| {
                    session.use_connection(|c| c.query("SELECT version FROM schema_version", &[]))
                })
            })?;
        rows.iter()
            .map(|row| NamespacedMigration::from_namespaced_version(text_at(row, 0, "version")?))
            .collect()
    }

    /// Applies, shard by shard, every available migration not in
    /// `already_applied` and not recorded on the shard. Each migration runs in
    /// its own transaction together with its bookkeeping row.
    pub fn apply_all(
        &self,
        author: &str,
        already_applied: &BTreeSet<NamespacedMigration>,
    ) -> DataResult<MigrationState> {
        if author.is_empty() || !author.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(DataError::usage(format!(
                "migration author must be a single word: '{author}'"
            )));
        }
        let ctx = self.context();
        let mut shards = BTreeMap::new();
        for shard in self.transacter.shards()?.iter() {
            let available = self.available_migrations(&shard.keyspace)?;
            let mut applied = already_applied.clone();
            if self.has_migration_table(shard)? {
                applied.extend(self.applied_migrations(shard)?);
            }
            let state = ShardMigrationState::new(available.clone(), applied.clone());
            for migration in state.missing() {
                let sql = self.loader.utf8(&migration.path).ok_or_else(|| {
                    DataError::Migration(format!("cannot read migration {}", migration.path))
                })?;
                let version = migration.namespaced_version();
                let started = Instant::now();
                self.transacter
                    .no_retries()
                    .transaction_on_shard(&ctx, shard, |session| {
                        session.use_connection(|c| {
                            c.execute_batch(&sql)?;
                            c.execute(RECORD_MIGRATION, &[Value::from(version.as_str()), Value::from(author)])?;
                            Ok(())
                        })
                    })
                    .map_err(|e| e.context(format!("applying {} on {shard}", migration.path)))?;
                info!(
                    name = self.name(),
                    %shard,
                    %migration,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "applied migration"
                );
            }
            applied.extend(available.iter().cloned());
            shards.insert(shard.clone(), ShardMigrationState::new(available, applied));
        }
        Ok(MigrationState { shards })
    }

    pub fn require_all(&self) -> DataResult<MigrationState> {
        if !self.transacter.provider().supports_migration_tracking() {
            warn!(
                name = self.name(),
                "backend does not track migrations per shard; skipping migration check"
            );
            return Ok(MigrationState::default());
        }
        let mut shards = BTreeMap::new();
        for shard in self.transacter.shards()?.iter() {
            shards.insert(shard.clone(), self.require_all_on(shard)?);
        }
        Ok(MigrationState { shards })
    }

    pub fn require_all_on(&self, shard: &Shard) -> DataResult<ShardMigrationState> {
        let available = self.available_migrations(&shard.keyspace)?;
        let applied = self
            .applied_migrations(shard)
            .map_err(|e| e.context(format!("{} is not ready", self.name())))?;
        let state = ShardMigrationState::new(available, applied);
        let missing = state.missing();
        if !missing.is_empty() {
            let shard_message = if shard.is_single_shard() {
                String::new()
            } else {
                format!(" shard {shard}")
            };
            let paths = missing
                .iter()
                .map(|m| m.path.as_str())
                .collect::<Vec<_>>()
                .join("\n  ");
            return Err(DataError::MissingMigrations {
                message: format!(
                    "{}{shard_message} is missing migrations:\n  {paths}",
                    self.name()
                ),
            });
        }
        Ok(state)
    }

    pub fn migration_state(&self) -> DataResult<MigrationState> {
        let mut shards = BTreeMap::new();
        for shard in self.transacter.shards()?.iter() {
            let available = self.available_migrations(&shard.keyspace)?;
            let applied = if self.has_migration_table(shard)? {
                self.applied_migrations(shard)?
            } else {
                BTreeSet::new()
            };
            shards.insert(shard.clone(), ShardMigrationState::new(available, applied));
        }
        Ok(MigrationState { shards })
    }
}
