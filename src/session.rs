use crate::checks::{Check, CheckSet, CowriteTracker, find_table_scan, is_write_statement};
use crate::cluster::PooledConnection;
use crate::context::{ActiveGuard, CallContext};
use crate::entity::{DbChild, DbEntity, EntityKind, EntityMeta, Gid, Id, validate_entity};
use crate::error::{DataError, DataResult};
use crate::shard::{Destination, Keyspace, Shard, TabletType, keyspace_id};
use crate::transacter::{
    DB_BEGIN_SPAN_NAME, DB_COMMIT_SPAN_NAME, DB_ROLLBACK_SPAN_NAME, Shared, TransacterOptions,
    traced,
};
use crate::types::{Row, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

type PreCommitHook = Box<dyn FnOnce(&mut Session) -> DataResult<()>>;
type PostCommitHook = Box<dyn FnOnce() -> DataResult<()>>;
type RollbackHook = Box<dyn FnOnce(&DataError)>;
pub(crate) type CloseHook = Box<dyn FnOnce() -> DataResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Idle,
    SessionOpen,
    Targeted,
    Began,
    Flushed,
    Committed,
    RolledBack,
    Closed,
}

#[derive(Default)]
struct Hooks {
    pre_commit: VecDeque<PreCommitHook>,
    post_commit: Vec<PostCommitHook>,
    rollback: Vec<RollbackHook>,
    close: Vec<CloseHook>,
}

/// One transaction scope. Connections are opened lazily, one per shard
/// touched, and all of them commit or roll back together.
pub struct Session {
    shared: Arc<Shared>,
    options: TransacterOptions,
    ctx: CallContext,
    guard: Option<ActiveGuard>,
    connections: BTreeMap<Shard, PooledConnection>,
    destinations: Vec<Destination>,
    disabled: CheckSet,
    cowrites: CowriteTracker,
    hooks: Hooks,
    phase: TransactionPhase,
}

impl Session {
    pub(crate) fn open(
        shared: Arc<Shared>,
        options: TransacterOptions,
        ctx: CallContext,
        guard: ActiveGuard,
    ) -> Self {
        let base = Destination {
            shard: if shared.provider.is_partitioned() {
                options.shard.clone()
            } else {
                None
            },
            tablet: Some(options.tablet),
        };
        let phase = if base.shard.is_some() {
            TransactionPhase::Targeted
        } else {
            TransactionPhase::SessionOpen
        };
        Self {
            shared,
            options,
            ctx,
            guard: Some(guard),
            connections: BTreeMap::new(),
            destinations: vec![base],
            disabled: CheckSet::empty(),
            cowrites: CowriteTracker::default(),
            hooks: Hooks::default(),
            phase,
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn current_destination(&self) -> Destination {
        self.destinations.last().cloned().unwrap_or_default()
    }

    pub fn is_partitioned(&self) -> bool {
        self.shared.provider.is_partitioned()
    }

    pub fn shards(&self) -> DataResult<Arc<BTreeSet<Shard>>> {
        self.shared.fetcher.shards()
    }

    pub fn shards_in(&self, keyspace: &str) -> DataResult<Vec<Shard>> {
        self.shared.fetcher.shards_in(&Keyspace::new(keyspace))
    }

    pub fn disabled_checks(&self) -> CheckSet {
        self.disabled
    }

    pub fn is_check_enabled(&self, check: Check) -> bool {
        self.check_enabled_with(check, CheckSet::empty())
    }

    pub(crate) fn check_enabled_with(&self, check: Check, extra: CheckSet) -> bool {
        let configured = match check {
            Check::Cowrite => self.shared.config.checks.cowrite,
            Check::FullScatter => self.shared.config.checks.full_scatter,
            Check::TableScan => self.shared.config.checks.table_scan,
        };
        configured
            && !self.options.disabled_checks.contains(check)
            && !self.disabled.contains(check)
            && !extra.contains(check)
    }

    /// Runs `work` with exactly `checks` disabled, or every check when
    /// `checks` is empty. The caller's set is restored afterwards.
    pub fn without_checks<R>(
        &mut self,
        checks: &[Check],
        work: impl FnOnce(&mut Session) -> DataResult<R>,
    ) -> DataResult<R> {
        let previous = self.disabled;
        self.disabled = if checks.is_empty() {
            CheckSet::all()
        } else {
            CheckSet::of(checks)
        };
        let result = work(self);
        self.disabled = previous;
        result
    }

    pub fn disable_checks<R>(
        &mut self,
        checks: &[Check],
        work: impl FnOnce(&mut Session) -> DataResult<R>,
    ) -> DataResult<R> {
        let previous = self.disabled;
        self.disabled = previous.union(CheckSet::of(checks));
        let result = work(self);
        self.disabled = previous;
        result
    }

    /// Pins statements inside `work` to `shard`. A no-op on unpartitioned backends.
    pub fn target<R>(
        &mut self,
        shard: &Shard,
        work: impl FnOnce(&mut Session) -> DataResult<R>,
    ) -> DataResult<R> {
        if !self.is_partitioned() {
            return work(self);
        }
        if !self.shards()?.contains(shard) {
            return Err(DataError::usage(format!("unknown shard {shard}")));
        }
        self.target_destination(Destination::shard(shard.clone()), work)
    }

    pub fn target_destination<R>(
        &mut self,
        destination: Destination,
        work: impl FnOnce(&mut Session) -> DataResult<R>,
    ) -> DataResult<R> {
        let merged = self.current_destination().merged_with(&destination);
        self.destinations.push(merged);
        let result = work(self);
        self.destinations.pop();
        result
    }

    pub fn on_pre_commit(&mut self, hook: impl FnOnce(&mut Session) -> DataResult<()> + 'static) {
        self.hooks.pre_commit.push_back(Box::new(hook));
    }

    pub fn on_post_commit(&mut self, hook: impl FnOnce() -> DataResult<()> + 'static) {
        self.hooks.post_commit.push(Box::new(hook));
    }

    pub fn on_rollback(&mut self, hook: impl FnOnce(&DataError) + 'static) {
        self.hooks.rollback.push(Box::new(hook));
    }

    pub fn on_session_close(&mut self, hook: impl FnOnce() -> DataResult<()> + 'static) {
        self.hooks.close.push(Box::new(hook));
    }

    pub fn save<E: DbEntity>(&mut self, entity: &mut E) -> DataResult<Id<E>> {
        validate_entity::<E>()?;
        let meta = EntityMeta::of::<E>();
        let id = match entity.id() {
            Some(id) => id,
            None => {
                let id = Id::new(self.shared.ids.next_id(E::TABLE));
                entity.set_id(id);
                id
            }
        };
        let values = entity_values(&meta, entity)?;
        let key = partition_key(&meta, id.raw(), &values)?;
        let shard = self.route_one(&meta, key, "save")?;
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            meta.table,
            meta.columns.join(", ")
        );
        self.execute_on(&shard, &sql, &values, CheckSet::empty(), key)?;
        Ok(id)
    }

    /// Writes every column of a saved entity. Entities with a version column
    /// are updated only if nobody else changed them first.
    pub fn update<E: DbEntity>(&mut self, entity: &mut E) -> DataResult<()> {
        validate_entity::<E>()?;
        let meta = EntityMeta::of::<E>();
        let id = entity
            .id()
            .ok_or_else(|| DataError::usage(format!("cannot update an unsaved {}", meta.name)))?;
        let values = entity_values(&meta, entity)?;
        let key = partition_key(&meta, id.raw(), &values)?;
        let shard = self.route_one(&meta, key, "update")?;

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for (column, value) in meta.columns.iter().zip(values).skip(1) {
            if Some(*column) == meta.version_column {
                continue;
            }
            sets.push(format!("{column} = ?"));
            params.push(value);
        }
        let mut sql_where = "id = ?".to_string();
        params.push(Value::Integer(id.raw()));
        let current_version = entity.version().unwrap_or(0);
        if let Some(version) = meta.version_column {
            sets.push(format!("{version} = {version} + 1"));
            sql_where.push_str(&format!(" AND {version} = ?"));
            params.push(Value::Integer(current_version));
        }
        let sql = format!("UPDATE {} SET {} WHERE {sql_where}", meta.table, sets.join(", "));
        let updated = self.execute_on(&shard, &sql, &params, CheckSet::empty(), key)?;
        if updated == 0 {
            return Err(if meta.version_column.is_some() {
                DataError::StaleObject {
                    table: meta.table.to_string(),
                    id: id.raw(),
                }
            } else {
                DataError::NotFound {
                    entity: meta.name.to_string(),
                    id: id.raw(),
                }
            });
        }
        if meta.version_column.is_some() {
            entity.set_version(current_version + 1);
        }
        Ok(())
    }

    pub fn load<E: DbEntity>(&mut self, id: Id<E>) -> DataResult<E> {
        self.load_or_null(id)?.ok_or_else(|| DataError::NotFound {
            entity: EntityMeta::of::<E>().name.to_string(),
            id: id.raw(),
        })
    }

    pub fn load_or_null<E: DbEntity>(&mut self, id: Id<E>) -> DataResult<Option<E>> {
        let meta = EntityMeta::of::<E>();
        let key = match meta.kind {
            EntityKind::PartitionChild { .. } => {
                return Err(DataError::usage(format!(
                    "{} is a partition child; load it with its root id using load_child",
                    meta.name
                )));
            }
            EntityKind::PartitionRoot => Some(id.raw()),
            EntityKind::Unsharded => None,
        };
        self.load_where::<E>(key, "id = ?", vec![Value::Integer(id.raw())])
    }

    pub fn load_child<E: DbChild>(&mut self, gid: Gid<E::Root, E>) -> DataResult<E> {
        self.load_child_or_null(gid)?.ok_or_else(|| DataError::NotFound {
            entity: EntityMeta::of::<E>().name.to_string(),
            id: gid.id.raw(),
        })
    }

    pub fn load_child_or_null<E: DbChild>(
        &mut self,
        gid: Gid<E::Root, E>,
    ) -> DataResult<Option<E>> {
        let meta = EntityMeta::of::<E>();
        let Some(root_column) = meta.partition_column() else {
            return Err(DataError::usage(format!("{} is not a partition child", meta.name)));
        };
        let predicate = format!("id = ? AND {root_column} = ?");
        self.load_where::<E>(
            Some(gid.root.raw()),
            &predicate,
            vec![Value::Integer(gid.id.raw()), Value::Integer(gid.root.raw())],
        )
    }

    fn load_where<E: DbEntity>(
        &mut self,
        key: Option<i64>,
        predicate: &str,
        params: Vec<Value>,
    ) -> DataResult<Option<E>> {
        validate_entity::<E>()?;
        let meta = EntityMeta::of::<E>();
        let shard = self.route_one(&meta, key, "load")?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {predicate}",
            meta.columns.join(", "),
            meta.table
        );
        let rows = self.query_on(&shard, &sql, &params, CheckSet::empty())?;
        match rows.first() {
            Some(row) => Ok(Some(E::from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn delete<E: DbEntity>(&mut self, entity: &E) -> DataResult<()> {
        let meta = EntityMeta::of::<E>();
        let id = entity
            .id()
            .ok_or_else(|| DataError::usage(format!("cannot delete an unsaved {}", meta.name)))?;
        let values = entity_values(&meta, entity)?;
        let key = partition_key(&meta, id.raw(), &values)?;
        let shard = self.route_one(&meta, key, "delete")?;
        let sql = format!("DELETE FROM {} WHERE id = ?", meta.table);
        let deleted =
            self.execute_on(&shard, &sql, &[Value::Integer(id.raw())], CheckSet::empty(), key)?;
        if deleted == 0 {
            return Err(DataError::NotFound {
                entity: meta.name.to_string(),
                id: id.raw(),
            });
        }
        Ok(())
    }

    /// Raw SQL against the current destination. Unpinned statements on a
    /// partitioned backend go to every shard.
    pub fn use_connection<R>(
        &mut self,
        work: impl FnOnce(&mut RawConnection<'_>) -> DataResult<R>,
    ) -> DataResult<R> {
        let mut raw = RawConnection { session: self };
        work(&mut raw)
    }

    /// Shards a statement on `keyspace` has to visit.
    pub(crate) fn route(
        &mut self,
        keyspace: &str,
        keys: Option<&BTreeSet<i64>>,
        extra: CheckSet,
        what: &str,
    ) -> DataResult<Vec<Shard>> {
        if !self.is_partitioned() {
            return Ok(vec![Shard::single_shard()]);
        }
        let keyspace = Keyspace::new(keyspace);
        if let Some(pinned) = self.current_destination().shard {
            if pinned.keyspace != keyspace {
                return Err(DataError::usage(format!(
                    "{what} on keyspace {keyspace} cannot run while targeted at {pinned}"
                )));
            }
            return Ok(vec![pinned]);
        }
        let shards = self.shared.fetcher.shards_in(&keyspace)?;
        if shards.is_empty() {
            return Err(DataError::usage(format!("keyspace {keyspace} has no shards")));
        }
        if let Some(keys) = keys {
            return Ok(shards
                .into_iter()
                .filter(|s| keys.iter().any(|k| s.contains(keyspace_id(*k))))
                .collect());
        }
        if shards.len() > 1 && self.check_enabled_with(Check::FullScatter, extra) {
            return Err(DataError::FullScatter {
                message: format!(
                    "{what} on keyspace {keyspace} is not bound to a shard and would visit all {} shards",
                    shards.len()
                ),
            });
        }
        Ok(shards)
    }

    fn route_one(&mut self, meta: &EntityMeta, key: Option<i64>, what: &str) -> DataResult<Shard> {
        let keys = key.map(|k| BTreeSet::from([k]));
        let shards = self.route(meta.keyspace, keys.as_ref(), CheckSet::empty(), what)?;
        let shard = shards.into_iter().next().ok_or_else(|| {
            DataError::usage(format!("{what} of {} found no shard", meta.name))
        })?;
        if let Some(key) = key
            && self.is_partitioned()
            && !shard.contains(keyspace_id(key))
        {
            return Err(DataError::usage(format!(
                "{what} of {} with partition key {key} does not belong on targeted shard {shard}",
                meta.name
            )));
        }
        Ok(shard)
    }

    fn connection(&mut self, shard: &Shard) -> DataResult<&PooledConnection> {
        if !self.connections.contains_key(shard) {
            let tablet = self.current_destination().tablet.unwrap_or(TabletType::Primary);
            let conn = self.shared.provider.open(shard, tablet)?;
            let begin = if self.options.read_only {
                "PRAGMA query_only = ON; BEGIN;"
            } else {
                "BEGIN IMMEDIATE;"
            };
            let shared = Arc::clone(&self.shared);
            let began = traced(shared.tracer.as_ref(), DB_BEGIN_SPAN_NAME, || {
                conn.connection().execute_batch(begin).map_err(DataError::from)
            });
            if let Err(e) = began {
                self.shared.provider.release(conn);
                return Err(e);
            }
            if let Some(guard) = self.guard.as_mut() {
                guard.note_connection(conn.id());
            }
            debug!(connection = conn.id(), %shard, %tablet, read_only = self.options.read_only, "began transaction");
            self.phase = TransactionPhase::Began;
            self.connections.insert(shard.clone(), conn);
        }
        self.connections
            .get(shard)
            .ok_or_else(|| DataError::ConnectionLost(format!("no connection for {shard}")))
    }

    fn check_table_scan(
        &mut self,
        shard: &Shard,
        sql: &str,
        params: &[Value],
        extra: CheckSet,
    ) -> DataResult<()> {
        if !self.check_enabled_with(Check::TableScan, extra) {
            return Ok(());
        }
        let conn = self.connection(shard)?;
        if let Some(table) = find_table_scan(conn.connection(), sql, params)? {
            return Err(DataError::TableScan {
                message: format!("statement scans table {table} on {shard}: {sql}"),
            });
        }
        Ok(())
    }

    pub(crate) fn query_on(
        &mut self,
        shard: &Shard,
        sql: &str,
        params: &[Value],
        extra: CheckSet,
    ) -> DataResult<Vec<Row>> {
        self.check_table_scan(shard, sql, params, extra)?;
        let conn = self.connection(shard)?;
        let mut stmt = conn.connection().prepare(sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(Value::from_sql_ref))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    pub(crate) fn execute_on(
        &mut self,
        shard: &Shard,
        sql: &str,
        params: &[Value],
        extra: CheckSet,
        group: Option<i64>,
    ) -> DataResult<usize> {
        if self.options.read_only {
            return Err(DataError::usage(format!(
                "cannot write in a read-only transaction: {sql}"
            )));
        }
        if is_write_statement(sql) {
            let enforce = self.is_partitioned() && self.check_enabled_with(Check::Cowrite, extra);
            self.cowrites.record(shard, group, enforce)?;
        }
        self.check_table_scan(shard, sql, params, extra)?;
        let conn = self.connection(shard)?;
        Ok(conn
            .connection()
            .execute(sql, rusqlite::params_from_iter(params.iter()))?)
    }

    pub(crate) fn execute_batch_on(&mut self, shard: &Shard, sql: &str) -> DataResult<()> {
        if self.options.read_only {
            return Err(DataError::usage("cannot run a batch in a read-only transaction"));
        }
        let conn = self.connection(shard)?;
        conn.connection().execute_batch(sql)?;
        Ok(())
    }

    pub(crate) fn run_pre_commit_hooks(&mut self) -> DataResult<()> {
        // Hooks may register further hooks; those run after the ones already queued.
        while let Some(hook) = self.hooks.pre_commit.pop_front() {
            hook(self)?;
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> DataResult<()> {
        self.phase = TransactionPhase::Flushed;
        let shared = Arc::clone(&self.shared);
        traced(shared.tracer.as_ref(), DB_COMMIT_SPAN_NAME, || {
            for (shard, conn) in &self.connections {
                conn.connection()
                    .execute_batch("COMMIT;")
                    .map_err(|e| DataError::from(e).context(format!("commit on {shard}")))?;
            }
            Ok(())
        })?;
        debug!(
            shards = self.connections.len(),
            shards_written = self.cowrites.shards_written(),
            "committed transaction"
        );
        self.phase = TransactionPhase::Committed;
        Ok(())
    }

    pub(crate) fn run_post_commit_hooks(&mut self) -> DataResult<()> {
        for hook in std::mem::take(&mut self.hooks.post_commit) {
            hook().map_err(|e| DataError::PostCommitHookFailed(Box::new(e)))?;
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self, cause: &DataError) {
        let shared = Arc::clone(&self.shared);
        let _ = traced(shared.tracer.as_ref(), DB_ROLLBACK_SPAN_NAME, || {
            for (shard, conn) in &self.connections {
                if conn.connection().is_autocommit() {
                    continue;
                }
                if let Err(e) = conn.connection().execute_batch("ROLLBACK;") {
                    warn!(%shard, error = %e, "rollback failed");
                }
            }
            Ok(())
        });
        self.phase = TransactionPhase::RolledBack;
        for hook in std::mem::take(&mut self.hooks.rollback) {
            hook(cause);
        }
    }

    pub(crate) fn with_span<R>(
        &mut self,
        name: &'static str,
        work: impl FnOnce(&mut Session) -> DataResult<R>,
    ) -> DataResult<R> {
        let shared = Arc::clone(&self.shared);
        traced(shared.tracer.as_ref(), name, || work(self))
    }

    pub(crate) fn first_connection(&self) -> Option<u64> {
        self.guard.as_ref().and_then(ActiveGuard::first_connection)
    }

    /// The close hooks are handed back so they run after the context is free.
    pub(crate) fn close(mut self) -> Vec<CloseHook> {
        for (_, conn) in std::mem::take(&mut self.connections) {
            self.shared.provider.release(conn);
        }
        self.guard = None;
        self.phase = TransactionPhase::Closed;
        std::mem::take(&mut self.hooks.close)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Only reached with open connections when work panicked.
        for (_, conn) in std::mem::take(&mut self.connections) {
            if !conn.connection().is_autocommit() {
                let _ = conn.connection().execute_batch("ROLLBACK;");
            }
            self.shared.provider.release(conn);
        }
    }
}

fn entity_values<E: DbEntity>(meta: &EntityMeta, entity: &E) -> DataResult<Vec<Value>> {
    let values = entity.to_values();
    if values.len() != meta.columns.len() {
        return Err(DataError::usage(format!(
            "{} produced {} values for {} columns",
            meta.name,
            values.len(),
            meta.columns.len()
        )));
    }
    Ok(values)
}

fn partition_key(meta: &EntityMeta, id: i64, values: &[Value]) -> DataResult<Option<i64>> {
    match meta.kind {
        EntityKind::Unsharded => Ok(None),
        EntityKind::PartitionRoot => Ok(Some(id)),
        EntityKind::PartitionChild { root_column } => {
            let root = meta
                .column_index(root_column)
                .and_then(|i| values.get(i))
                .and_then(Value::as_i64);
            match root {
                Some(root) => Ok(Some(root)),
                None => Err(DataError::usage(format!(
                    "{} must have an integer {root_column}",
                    meta.name
                ))),
            }
        }
    }
}

/// Raw SQL access inside a session. Statements pass through the same
/// scale-safety checks as generated queries.
pub struct RawConnection<'s> {
    session: &'s mut Session,
}

impl RawConnection<'_> {
    pub fn shard(&self) -> Option<Shard> {
        self.session.current_destination().shard
    }

    fn targets(&mut self, what: &str) -> DataResult<Vec<Shard>> {
        if !self.session.is_partitioned() {
            return Ok(vec![Shard::single_shard()]);
        }
        if let Some(shard) = self.session.current_destination().shard {
            return Ok(vec![shard]);
        }
        let shards: Vec<Shard> = self.session.shards()?.iter().cloned().collect();
        if shards.len() > 1 && self.session.is_check_enabled(Check::FullScatter) {
            return Err(DataError::FullScatter {
                message: format!(
                    "{what} is not targeted and would visit all {} shards",
                    shards.len()
                ),
            });
        }
        Ok(shards)
    }

    pub fn execute(&mut self, sql: &str, params: &[Value]) -> DataResult<usize> {
        let mut total = 0;
        for shard in self.targets(sql)? {
            total += self
                .session
                .execute_on(&shard, sql, params, CheckSet::empty(), None)?;
        }
        Ok(total)
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> DataResult<Vec<Row>> {
        let mut rows = Vec::new();
        for shard in self.targets(sql)? {
            rows.extend(self.session.query_on(&shard, sql, params, CheckSet::empty())?);
        }
        Ok(rows)
    }

    /// Runs several `;`-separated statements without checks, as migrations do.
    pub fn execute_batch(&mut self, sql: &str) -> DataResult<()> {
        for shard in self.targets("batch")? {
            self.session.execute_batch_on(&shard, sql)?;
        }
        Ok(())
    }
}
