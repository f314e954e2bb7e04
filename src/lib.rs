pub mod checks;
pub mod cluster;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod migrate;
pub mod query;
pub mod session;
pub mod shard;
pub mod transacter;
pub mod types;

pub use checks::{Check, CheckSet};
pub use cluster::{ConnectionProvider, PooledConnection, ShardListFetcher, SqliteCluster};
pub use config::{
    BackendType, DataSourceConfig, KeyspaceConfig, QueryLimits, RetryConfig, ScaleSafetyConfig,
};
pub use context::CallContext;
pub use entity::{DbChild, DbEntity, EntityKind, EntityMeta, Gid, Id, IdGenerator, RandomIdGenerator};
pub use error::{DataError, DataErrorCode, DataResult, ResultExt};
pub use migrate::{
    FilesystemResourceLoader, MemoryResourceLoader, MigrationState, NamespacedMigration,
    ResourceLoader, SchemaMigrator, ShardMigrationState,
};
pub use query::{
    Args, Operator, OrBuilder, Projection, ProjectionDecl, QueryDeclaration, QueryExecutor,
    QueryFactory, QueryInterface, ResultKind, ReturnShape,
};
pub use session::{RawConnection, Session, TransactionPhase};
pub use shard::{Destination, KeyRange, Keyspace, Shard, TabletType};
pub use transacter::{Attempted, Transacter, TransacterOptions, TransactionTracer};
pub use types::{Row, RowDecodeError, Value};

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// A configured data source: cluster, transacter, query factory and
/// schema migrator wired together.
pub struct Database {
    cluster: Arc<SqliteCluster>,
    transacter: Transacter,
    queries: Arc<QueryFactory>,
    migrator: SchemaMigrator,
}

impl Database {
    /// Opens the data source with migrations read from the working directory.
    pub fn open(config: DataSourceConfig) -> DataResult<Self> {
        Self::open_with(config, Arc::new(FilesystemResourceLoader::new(".")), None)
    }

    pub fn open_with(
        config: DataSourceConfig,
        resources: Arc<dyn ResourceLoader>,
        tracer: Option<Arc<dyn TransactionTracer>>,
    ) -> DataResult<Self> {
        config.validate()?;
        info!(
            name = %config.name,
            backend = ?config.backend,
            data_dir = %config.data_dir.display(),
            keyspaces = config.keyspaces.len(),
            max_max_rows = config.query_limits.max_max_rows,
            row_count_error_limit = config.query_limits.row_count_error_limit,
            row_count_warning_limit = config.query_limits.row_count_warning_limit,
            cowrite_check = config.checks.cowrite,
            full_scatter_check = config.checks.full_scatter,
            table_scan_check = config.checks.table_scan,
            max_attempts = config.retry.max_attempts,
            "opening data source"
        );
        let cluster = Arc::new(SqliteCluster::open(&config)?);
        let provider: Arc<dyn ConnectionProvider> = cluster.clone();
        let mut builder = Transacter::builder(provider, config.clone());
        if let Some(tracer) = tracer {
            builder = builder.tracer(tracer);
        }
        let transacter = builder.build()?;
        let queries = Arc::new(QueryFactory::new(config.query_limits));
        let migrator = SchemaMigrator::new(transacter.clone(), resources);
        Ok(Self {
            cluster,
            transacter,
            queries,
            migrator,
        })
    }

    pub fn config(&self) -> &DataSourceConfig {
        self.transacter.config()
    }

    pub fn cluster(&self) -> &Arc<SqliteCluster> {
        &self.cluster
    }

    pub fn transacter(&self) -> &Transacter {
        &self.transacter
    }

    pub fn queries(&self) -> &Arc<QueryFactory> {
        &self.queries
    }

    pub fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }

    pub fn new_query<Q: QueryInterface>(&self) -> DataResult<Q> {
        self.queries.new_query::<Q>()
    }

    pub fn transaction<T>(
        &self,
        ctx: &CallContext,
        work: impl FnMut(&mut Session) -> DataResult<T>,
    ) -> DataResult<T> {
        self.transacter.transaction(ctx, work)
    }

    /// Creates bookkeeping tables, applies what each shard is missing and
    /// checks that nothing is left over.
    pub fn migrate(&self, author: &str) -> DataResult<MigrationState> {
        let applied = self.migrator.initialize()?;
        info!(
            name = %self.config().name,
            applied = applied.len(),
            "migration bookkeeping ready"
        );
        // Each shard's own table decides what it still needs.
        self.migrator.apply_all(author, &BTreeSet::new())?;
        self.migrator.require_all()
    }
}
