use crate::checks::{Check, CheckSet};
use crate::config::QueryLimits;
use crate::entity::{DbEntity, EntityMeta, is_valid_path};
use crate::error::{DataError, DataResult};
use crate::query::descriptor::{MethodHandler, Operator, ProjectionDecl, QueryDescriptor};
use crate::query::plan::{Expr, Order, Statement};
use crate::session::Session;
use crate::shard::Shard;
use crate::transacter::DB_SELECT_SPAN_NAME;
use crate::types::{Row, RowDecodeError, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub type PredicateFactory = Arc<dyn Fn(&EntityMeta) -> DataResult<Expr> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Args {
    None,
    Value(Value),
    Values(Vec<Value>),
}

impl Args {
    pub fn none() -> Self {
        Args::None
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Args::Value(value.into())
    }

    pub fn values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Args::Values(values.into_iter().map(Into::into).collect())
    }
}

/// Accumulated state of one query: constraints, orders, limits and the
/// checks it runs without. Cloning gives an independent copy.
pub struct QueryExecutor<E> {
    descriptor: Arc<QueryDescriptor>,
    limits: QueryLimits,
    constraints: Vec<PredicateFactory>,
    orders: Vec<(String, bool)>,
    first_result: usize,
    max_rows: i64,
    disabled: CheckSet,
    hints: Vec<String>,
    predicates_only: bool,
    problem: Option<String>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for QueryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            descriptor: Arc::clone(&self.descriptor),
            limits: self.limits,
            constraints: self.constraints.clone(),
            orders: self.orders.clone(),
            first_result: self.first_result,
            max_rows: self.max_rows,
            disabled: self.disabled,
            hints: self.hints.clone(),
            predicates_only: self.predicates_only,
            problem: self.problem.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for QueryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("query", &self.descriptor.query)
            .field("constraints", &self.constraints.len())
            .field("orders", &self.orders)
            .field("first_result", &self.first_result)
            .field("max_rows", &self.max_rows)
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl<E: DbEntity> QueryExecutor<E> {
    pub(crate) fn new(descriptor: Arc<QueryDescriptor>, limits: QueryLimits) -> Self {
        Self {
            descriptor,
            limits,
            constraints: Vec::new(),
            orders: Vec::new(),
            first_result: 0,
            max_rows: -1,
            disabled: CheckSet::empty(),
            hints: Vec::new(),
            predicates_only: false,
            problem: None,
            _entity: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn max_rows_value(&self) -> i64 {
        self.max_rows
    }

    pub fn first_result_value(&self) -> usize {
        self.first_result
    }

    pub fn disabled_checks(&self) -> CheckSet {
        self.disabled
    }

    fn fail(&mut self, message: String) {
        if self.problem.is_none() {
            self.problem = Some(message);
        }
    }

    fn ensure_usable(&self) -> DataResult<()> {
        match &self.problem {
            Some(message) => Err(DataError::usage(message.clone())),
            None => Ok(()),
        }
    }

    /// Dispatches a declared constraint or order method. Misuse is recorded
    /// and reported by the next terminal operation.
    pub fn invoke(&mut self, method: &str, args: Args) -> &mut Self {
        match self.descriptor.handler(method).cloned() {
            Some(MethodHandler::Constraint { path, operator }) => {
                match check_args(method, operator, &args) {
                    Ok(()) => self.constraints.push(constraint_factory(path, operator, args)),
                    Err(message) => self.fail(message),
                }
            }
            Some(MethodHandler::Order { path, asc }) => {
                if self.predicates_only {
                    self.fail("cannot define sort order on this query".to_string());
                } else {
                    self.orders.push((path, asc));
                }
            }
            Some(MethodHandler::Select { .. }) => self.fail(format!(
                "{method}() is a select; call it through select_list, select_unique, select_values or select_value"
            )),
            None => self.fail(format!(
                "unexpected call to {method}() on {}",
                self.descriptor.query
            )),
        }
        self
    }

    pub fn constraint(
        &mut self,
        build: impl Fn(&EntityMeta) -> DataResult<Expr> + Send + Sync + 'static,
    ) -> &mut Self {
        self.constraints.push(Arc::new(build));
        self
    }

    pub fn dynamic_add_constraint(&mut self, path: &str, operator: Operator, args: Args) -> &mut Self {
        if !is_valid_path(path) {
            self.fail(format!("path is not valid: '{path}'"));
            return self;
        }
        match check_args(path, operator, &args) {
            Ok(()) => self
                .constraints
                .push(constraint_factory(path.to_string(), operator, args)),
            Err(message) => self.fail(message),
        }
        self
    }

    pub fn dynamic_add_order(&mut self, path: &str, asc: bool) -> &mut Self {
        if !is_valid_path(path) {
            self.fail(format!("path is not valid: '{path}'"));
        } else if self.predicates_only {
            self.fail("cannot define sort order on this query".to_string());
        } else {
            self.orders.push((path.to_string(), asc));
        }
        self
    }

    /// Adds a disjunction. Each option is a conjunction of its own constraints.
    pub fn or(&mut self, build: impl FnOnce(&mut OrBuilder<E>)) -> &mut Self {
        let mut builder = OrBuilder {
            template: self.option_template(),
            options: Vec::new(),
        };
        build(&mut builder);
        if builder.options.is_empty() {
            self.fail("or clause with no options".to_string());
            return self;
        }
        let mut options = Vec::new();
        for option in builder.options {
            if let Some(problem) = option.problem {
                self.fail(problem);
                return self;
            }
            if option.constraints.is_empty() {
                self.fail("or option with no constraints".to_string());
                return self;
            }
            options.push(option.constraints);
        }
        self.constraints.push(Arc::new(move |meta: &EntityMeta| {
            let choices = options
                .iter()
                .map(|constraints| build_conjunction(constraints, meta))
                .collect::<DataResult<Vec<_>>>()?;
            Ok(Expr::any(choices.into_iter().flatten().collect()))
        }));
        self
    }

    fn option_template(&self) -> QueryExecutor<E> {
        let mut option = QueryExecutor::new(Arc::clone(&self.descriptor), self.limits);
        option.predicates_only = true;
        option
    }

    /// `-1` for no explicit cap, otherwise `1..=max_max_rows`.
    pub fn max_rows(&mut self, max_rows: i64) -> &mut Self {
        let in_range = max_rows >= 1 && max_rows as u64 <= self.limits.max_max_rows as u64;
        if max_rows == -1 || in_range {
            self.max_rows = max_rows;
        } else {
            self.fail(format!("out of range: {max_rows}"));
        }
        self
    }

    pub fn first_result(&mut self, first_result: usize) -> &mut Self {
        self.first_result = first_result;
        self
    }

    pub fn add_query_hint(&mut self, hint: impl Into<String>) -> &mut Self {
        self.hints.push(hint.into());
        self
    }

    pub fn disable_check(&mut self, check: Check) -> &mut Self {
        self.disabled = self.disabled.with(check);
        self
    }

    pub fn allow_table_scan(&mut self) -> &mut Self {
        self.disable_check(Check::TableScan)
    }

    pub fn allow_full_scatter(&mut self) -> &mut Self {
        self.disable_check(Check::FullScatter)
    }

    pub fn predicate(&self) -> DataResult<Option<Expr>> {
        let meta = EntityMeta::of::<E>();
        let predicate = build_conjunction(&self.constraints, &meta)?;
        if let Some(predicate) = &predicate {
            predicate.validate_depth()?;
        }
        Ok(predicate)
    }

    pub fn list(&self, session: &mut Session) -> DataResult<Vec<E>> {
        let meta = EntityMeta::of::<E>();
        let rows = self.fetch(session, meta.columns.to_vec(), true)?;
        rows.iter()
            .map(|row| E::from_row(row).map_err(DataError::from))
            .collect()
    }

    pub fn unique_result(&self, session: &mut Session) -> DataResult<Option<E>> {
        let meta = EntityMeta::of::<E>();
        let rows = self.fetch(session, meta.columns.to_vec(), false)?;
        match rows.first() {
            Some(row) => Ok(Some(E::from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self, session: &mut Session) -> DataResult<i64> {
        self.ensure_usable()?;
        if self.predicates_only {
            return Err(DataError::usage("cannot select on this query"));
        }
        if self.max_rows != -1 {
            return Err(DataError::usage("count() cannot be combined with maxRows"));
        }
        let meta = EntityMeta::of::<E>();
        let predicate = self.predicate()?;
        if predicate.as_ref().is_some_and(Expr::is_always_false) {
            return Ok(0);
        }
        let shards = self.shards_for(session, &meta, predicate.as_ref(), "count")?;
        let (sql, params) = Statement::count(meta.table)
            .where_(predicate)
            .hints(self.hints.clone())
            .to_sql();
        session.with_span(DB_SELECT_SPAN_NAME, |session| {
            let mut total = 0;
            for shard in &shards {
                let rows = session.query_on(shard, &sql, &params, self.disabled)?;
                total += rows
                    .first()
                    .and_then(|row| row.values.first())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
            }
            Ok(total)
        })
    }

    pub fn delete(&self, session: &mut Session) -> DataResult<usize> {
        self.ensure_usable()?;
        if self.predicates_only {
            return Err(DataError::usage("cannot delete on this query"));
        }
        if !self.orders.is_empty() {
            return Err(DataError::usage("orderBy shouldn't be used for a delete"));
        }
        let meta = EntityMeta::of::<E>();
        let predicate = self.predicate()?;
        if predicate.as_ref().is_some_and(Expr::is_always_false) {
            return Ok(0);
        }
        let group = meta
            .partition_column()
            .and_then(|column| predicate.as_ref()?.partition_keys(column))
            .filter(|keys| keys.len() == 1)
            .and_then(|keys| keys.first().copied());
        let shards = self.shards_for(session, &meta, predicate.as_ref(), "delete")?;
        let (sql, params) = Statement::delete(meta.table)
            .where_(predicate)
            .hints(self.hints.clone())
            .to_sql();
        let mut deleted = 0;
        for shard in &shards {
            deleted += session.execute_on(shard, &sql, &params, self.disabled, group)?;
        }
        Ok(deleted)
    }

    pub fn select_list<P: Projection>(&self, session: &mut Session, method: &str) -> DataResult<Vec<P>> {
        let paths = self.projection_select::<P>(method, true)?;
        let rows = self.fetch_paths(session, &paths, true)?;
        rows.into_iter()
            .map(|row| P::from_values(row.into_values()).map_err(DataError::from))
            .collect()
    }

    pub fn select_unique<P: Projection>(&self, session: &mut Session, method: &str) -> DataResult<Option<P>> {
        let paths = self.projection_select::<P>(method, false)?;
        let rows = self.fetch_paths(session, &paths, false)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(P::from_values(row.into_values())?)),
            None => Ok(None),
        }
    }

    pub fn select_values(&self, session: &mut Session, method: &str) -> DataResult<Vec<Value>> {
        let path = self.value_select(method, true)?;
        let rows = self.fetch_paths(session, &[path], true)?;
        Ok(rows.into_iter().filter_map(|row| row.into_values().into_iter().next()).collect())
    }

    pub fn select_value(&self, session: &mut Session, method: &str) -> DataResult<Option<Value>> {
        let path = self.value_select(method, false)?;
        let rows = self.fetch_paths(session, &[path], false)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_values().into_iter().next()))
    }

    pub fn dynamic_list(&self, session: &mut Session, paths: &[&str]) -> DataResult<Vec<Vec<Value>>> {
        let paths = checked_paths(paths)?;
        let rows = self.fetch_paths(session, &paths, true)?;
        Ok(rows.into_iter().map(Row::into_values).collect())
    }

    pub fn dynamic_unique_result(
        &self,
        session: &mut Session,
        paths: &[&str],
    ) -> DataResult<Option<Vec<Value>>> {
        let paths = checked_paths(paths)?;
        let rows = self.fetch_paths(session, &paths, false)?;
        Ok(rows.into_iter().next().map(Row::into_values))
    }

    fn select_handler(&self, method: &str) -> DataResult<(bool, Option<&str>, &[String])> {
        match self.descriptor.handler(method) {
            Some(MethodHandler::Select {
                returns_list,
                projection,
                paths,
            }) => Ok((*returns_list, projection.as_deref(), paths)),
            _ => Err(DataError::usage(format!(
                "{method}() is not a select method of {}",
                self.descriptor.query
            ))),
        }
    }

    fn projection_select<P: Projection>(&self, method: &str, list: bool) -> DataResult<Vec<String>> {
        let (returns_list, projection, paths) = self.select_handler(method)?;
        check_select_shape(method, returns_list, list)?;
        let expected = P::declaration().name;
        if projection != Some(expected.as_str()) {
            return Err(DataError::usage(format!(
                "{method}() does not select {expected}"
            )));
        }
        Ok(paths.to_vec())
    }

    fn value_select(&self, method: &str, list: bool) -> DataResult<String> {
        let (returns_list, projection, paths) = self.select_handler(method)?;
        check_select_shape(method, returns_list, list)?;
        match (projection, paths) {
            (None, [path]) => Ok(path.clone()),
            _ => Err(DataError::usage(format!(
                "{method}() selects a projection; call select_list or select_unique"
            ))),
        }
    }

    fn fetch_paths(&self, session: &mut Session, paths: &[String], list: bool) -> DataResult<Vec<Row>> {
        let meta = EntityMeta::of::<E>();
        let columns = paths
            .iter()
            .map(|path| meta.resolve(path))
            .collect::<DataResult<Vec<_>>>()?;
        self.fetch(session, columns, list)
    }

    fn shards_for(
        &self,
        session: &mut Session,
        meta: &EntityMeta,
        predicate: Option<&Expr>,
        what: &str,
    ) -> DataResult<Vec<Shard>> {
        let keys: Option<BTreeSet<i64>> = meta
            .partition_column()
            .and_then(|column| predicate?.partition_keys(column));
        session.route(
            meta.keyspace,
            keys.as_ref(),
            self.disabled,
            &format!("{what} on {}", meta.table),
        )
    }

    fn fetch(&self, session: &mut Session, columns: Vec<&'static str>, list: bool) -> DataResult<Vec<Row>> {
        self.ensure_usable()?;
        if self.predicates_only {
            return Err(DataError::usage("cannot select on this query"));
        }
        let meta = EntityMeta::of::<E>();
        let predicate = self.predicate()?;
        let orders = self
            .orders
            .iter()
            .map(|(path, asc)| Ok((meta.resolve(path)?.to_string(), Order::from_asc(*asc))))
            .collect::<DataResult<Vec<_>>>()?;
        let max = self.effective_max_rows(list);

        let rows = if predicate.as_ref().is_some_and(Expr::is_always_false) {
            Vec::new()
        } else {
            let shards = self.shards_for(session, &meta, predicate.as_ref(), "query")?;
            session.with_span(DB_SELECT_SPAN_NAME, |session| {
                self.run_select(session, &meta, &shards, columns, predicate, orders, max)
            })?
        };
        self.check_row_count(list, rows.len())?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_select(
        &self,
        session: &mut Session,
        meta: &EntityMeta,
        shards: &[Shard],
        columns: Vec<&'static str>,
        predicate: Option<Expr>,
        orders: Vec<(String, Order)>,
        max: usize,
    ) -> DataResult<Vec<Row>> {
        if let [shard] = shards {
            let (sql, params) = Statement::select(columns, meta.table)
                .where_(predicate)
                .order_by(orders)
                .limit(Some(max))
                .offset(self.first_result)
                .hints(self.hints.clone())
                .to_sql();
            debug!(%shard, sql = %sql, "query");
            return session.query_on(shard, &sql, &params, self.disabled);
        }

        // Sort keys missing from the select list are fetched too and cut after merging.
        let width = columns.len();
        let mut fetched: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mut sort_keys = Vec::new();
        for (column, order) in &orders {
            let index = match fetched.iter().position(|c| c.eq_ignore_ascii_case(column)) {
                Some(index) => index,
                None => {
                    fetched.push(column.clone());
                    fetched.len() - 1
                }
            };
            sort_keys.push((index, *order));
        }
        let (sql, params) = Statement::select(fetched, meta.table)
            .where_(predicate)
            .order_by(orders)
            .limit(Some(self.first_result.saturating_add(max)))
            .hints(self.hints.clone())
            .to_sql();
        let mut merged = Vec::new();
        for shard in shards {
            debug!(%shard, sql = %sql, "scatter query");
            merged.extend(session.query_on(shard, &sql, &params, self.disabled)?);
        }
        merged.sort_by(|a, b| compare_rows(a, b, &sort_keys));
        let result_columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().into();
        Ok(merged
            .into_iter()
            .skip(self.first_result)
            .take(max)
            .map(|row| {
                let mut values = row.into_values();
                values.truncate(width);
                Row::new(Arc::clone(&result_columns), values)
            })
            .collect())
    }

    fn effective_max_rows(&self, list: bool) -> usize {
        if !list {
            // Two rows are enough to tell the result was not unique.
            2
        } else if self.max_rows != -1 {
            self.max_rows as usize
        } else {
            self.limits.max_max_rows + 1
        }
    }

    fn check_row_count(&self, list: bool, rows: usize) -> DataResult<()> {
        if !list {
            if rows > 1 {
                return Err(DataError::NonUniqueResult { rows });
            }
        } else if self.max_rows == -1 {
            if rows > self.limits.max_max_rows {
                return Err(DataError::RowLimitExceeded { rows });
            } else if rows > self.limits.row_count_error_limit {
                error!(
                    query = %self.descriptor.query,
                    "Unbounded query returned {rows} rows. (Specify maxRows to suppress this error)"
                );
            } else if rows > self.limits.row_count_warning_limit {
                warn!(
                    query = %self.descriptor.query,
                    "Unbounded query returned {rows} rows. (Specify maxRows to suppress this warning)"
                );
            }
        }
        Ok(())
    }
}

pub struct OrBuilder<E> {
    template: QueryExecutor<E>,
    options: Vec<QueryExecutor<E>>,
}

impl<E: DbEntity> OrBuilder<E> {
    pub fn option(&mut self, build: impl FnOnce(&mut QueryExecutor<E>)) -> &mut Self {
        let mut option = self.template.clone();
        build(&mut option);
        self.options.push(option);
        self
    }
}

pub trait Projection: Sized {
    fn declaration() -> ProjectionDecl;

    /// Values arrive in declaration order.
    fn from_values(values: Vec<Value>) -> Result<Self, RowDecodeError>;
}

fn build_conjunction(constraints: &[PredicateFactory], meta: &EntityMeta) -> DataResult<Option<Expr>> {
    let exprs = constraints
        .iter()
        .map(|factory| factory(meta))
        .collect::<DataResult<Vec<_>>>()?;
    Ok(Expr::all(exprs))
}

fn check_args(method: &str, operator: Operator, args: &Args) -> Result<(), String> {
    let ok = match args {
        Args::None => operator.arity() == 0,
        Args::Value(_) => operator.arity() == 1 && !operator.takes_collection(),
        Args::Values(_) => operator.takes_collection(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("{method}() called with arguments that do not fit {operator}"))
    }
}

fn constraint_factory(path: String, operator: Operator, args: Args) -> PredicateFactory {
    Arc::new(move |meta: &EntityMeta| {
        let column = meta.resolve(&path)?.to_string();
        constraint_expr(column, operator, &args)
    })
}

fn constraint_expr(column: String, operator: Operator, args: &Args) -> DataResult<Expr> {
    let expr = match (operator, args) {
        (Operator::IsNull, Args::None) => Expr::IsNull(column),
        (Operator::IsNotNull, Args::None) => Expr::IsNotNull(column),
        (Operator::In, Args::Values(values)) => Expr::In(column, values.clone()),
        (Operator::NotIn, Args::Values(values)) => Expr::NotIn(column, values.clone()),
        (Operator::Eq, Args::Value(v)) => Expr::Eq(column, v.clone()),
        (Operator::EqOrIsNull, Args::Value(v)) if v.is_null() => Expr::IsNull(column),
        (Operator::EqOrIsNull, Args::Value(v)) => Expr::Eq(column, v.clone()),
        (Operator::Ne, Args::Value(v)) => Expr::Ne(column, v.clone()),
        (Operator::Lt, Args::Value(v)) => Expr::Lt(column, v.clone()),
        (Operator::Le, Args::Value(v)) => Expr::Lte(column, v.clone()),
        (Operator::Gt, Args::Value(v)) => Expr::Gt(column, v.clone()),
        (Operator::Ge, Args::Value(v)) => Expr::Gte(column, v.clone()),
        (operator, args) => {
            return Err(DataError::usage(format!(
                "{operator} on {column} cannot take {args:?}"
            )));
        }
    };
    Ok(expr)
}

fn check_select_shape(method: &str, returns_list: bool, list: bool) -> DataResult<()> {
    match (returns_list, list) {
        (true, false) => Err(DataError::usage(format!(
            "{method}() returns a list; call select_list or select_values"
        ))),
        (false, true) => Err(DataError::usage(format!(
            "{method}() returns a single value; call select_unique or select_value"
        ))),
        _ => Ok(()),
    }
}

fn checked_paths(paths: &[&str]) -> DataResult<Vec<String>> {
    if paths.is_empty() {
        return Err(DataError::usage("select needs at least one path"));
    }
    paths
        .iter()
        .map(|path| {
            if is_valid_path(path) {
                Ok(path.to_string())
            } else {
                Err(DataError::usage(format!("path is not valid: '{path}'")))
            }
        })
        .collect()
}

fn compare_rows(a: &Row, b: &Row, keys: &[(usize, Order)]) -> Ordering {
    for (index, order) in keys {
        let ordering = a.values.get(*index).cmp(&b.values.get(*index));
        let ordering = match order {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::{Args, check_args, constraint_expr};
    use crate::query::descriptor::Operator;
    use crate::query::plan::Expr;
    use crate::types::Value;

    #[test]
    fn eq_or_is_null_switches_on_null_argument() {
        assert_eq!(
            constraint_expr("name".into(), Operator::EqOrIsNull, &Args::value(Value::Null))
                .expect("expr"),
            Expr::IsNull("name".into())
        );
        assert_eq!(
            constraint_expr("name".into(), Operator::EqOrIsNull, &Args::value("Leia")).expect("expr"),
            Expr::Eq("name".into(), Value::from("Leia"))
        );
    }

    #[test]
    fn argument_shapes_follow_operators() {
        assert!(check_args("m", Operator::IsNull, &Args::none()).is_ok());
        assert!(check_args("m", Operator::IsNull, &Args::value(1)).is_err());
        assert!(check_args("m", Operator::In, &Args::values([1, 2])).is_ok());
        assert!(check_args("m", Operator::In, &Args::value(1)).is_err());
        assert!(check_args("m", Operator::Eq, &Args::values([1])).is_err());
    }
}
