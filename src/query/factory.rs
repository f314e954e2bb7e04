use crate::checks::Check;
use crate::config::QueryLimits;
use crate::entity::{DbEntity, short_type_name};
use crate::error::DataResult;
use crate::query::descriptor::{QueryDeclaration, QueryDescriptor};
use crate::query::executor::{Args, OrBuilder, QueryExecutor};
use crate::session::Session;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A typed query over one entity. Implementations declare their methods once
/// in `declare` and forward each method to the executor with `call`.
pub trait QueryInterface: Sized + 'static {
    type Entity: DbEntity;

    fn declare() -> QueryDeclaration;

    fn from_executor(executor: QueryExecutor<Self::Entity>) -> Self;

    fn executor(&self) -> &QueryExecutor<Self::Entity>;

    fn executor_mut(&mut self) -> &mut QueryExecutor<Self::Entity>;

    fn call(mut self, method: &str, args: Args) -> Self {
        self.executor_mut().invoke(method, args);
        self
    }

    fn or(mut self, build: impl FnOnce(&mut OrBuilder<Self::Entity>)) -> Self {
        self.executor_mut().or(build);
        self
    }

    fn max_rows(mut self, max_rows: i64) -> Self {
        self.executor_mut().max_rows(max_rows);
        self
    }

    fn first_result(mut self, first_result: usize) -> Self {
        self.executor_mut().first_result(first_result);
        self
    }

    fn disable_check(mut self, check: Check) -> Self {
        self.executor_mut().disable_check(check);
        self
    }

    fn allow_table_scan(self) -> Self {
        self.disable_check(Check::TableScan)
    }

    fn add_query_hint(mut self, hint: &str) -> Self {
        self.executor_mut().add_query_hint(hint);
        self
    }

    fn list(&self, session: &mut Session) -> DataResult<Vec<Self::Entity>> {
        self.executor().list(session)
    }

    fn unique_result(&self, session: &mut Session) -> DataResult<Option<Self::Entity>> {
        self.executor().unique_result(session)
    }

    fn count(&self, session: &mut Session) -> DataResult<i64> {
        self.executor().count(session)
    }

    fn delete(&self, session: &mut Session) -> DataResult<usize> {
        self.executor().delete(session)
    }
}

pub struct QueryFactory {
    limits: QueryLimits,
    descriptors: RwLock<HashMap<TypeId, Arc<QueryDescriptor>>>,
    compilations: AtomicU64,
}

impl QueryFactory {
    pub fn new(limits: QueryLimits) -> Self {
        Self {
            limits,
            descriptors: RwLock::new(HashMap::new()),
            compilations: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> QueryLimits {
        self.limits
    }

    /// Compiled descriptor for `Q`. Concurrent first uses may each compile;
    /// the first stored descriptor wins.
    pub fn descriptor<Q: QueryInterface>(&self) -> DataResult<Arc<QueryDescriptor>> {
        let key = TypeId::of::<Q>();
        if let Some(descriptor) = self.descriptors.read().get(&key) {
            return Ok(Arc::clone(descriptor));
        }
        let compiled = Arc::new(Q::declare().compile()?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!(
            query = %compiled.query,
            handlers = compiled.handlers.len(),
            "compiled query descriptor"
        );
        let mut descriptors = self.descriptors.write();
        Ok(Arc::clone(descriptors.entry(key).or_insert(compiled)))
    }

    pub fn new_query<Q: QueryInterface>(&self) -> DataResult<Q> {
        let descriptor = self.descriptor::<Q>()?;
        Ok(Q::from_executor(QueryExecutor::new(descriptor, self.limits)))
    }

    /// An executor with no declared methods, driven through the dynamic
    /// constraint, order and select operations.
    pub fn dynamic_query<E: DbEntity>(&self) -> QueryExecutor<E> {
        let descriptor = QueryDescriptor::empty(format!("dynamic {}", short_type_name::<E>()));
        QueryExecutor::new(Arc::new(descriptor), self.limits)
    }

    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl Default for QueryFactory {
    fn default() -> Self {
        Self::new(QueryLimits::default())
    }
}
