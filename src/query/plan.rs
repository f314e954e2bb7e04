use crate::error::{DataError, DataResult};
use crate::types::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Maximum nesting depth for expressions to prevent stack overflow
const MAX_EXPR_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn from_asc(asc: bool) -> Self {
        if asc { Order::Asc } else { Order::Desc }
    }
}

/// A predicate over column names. `And`/`Or` stay flat when chained.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    Like(String, String),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    AlwaysFalse,
}

impl Expr {
    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(conjuncts([self, rhs]))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(disjuncts([self, rhs]))
    }

    pub fn all(exprs: Vec<Expr>) -> Option<Expr> {
        let mut terms = conjuncts(exprs);
        match terms.len() {
            0 | 1 => terms.pop(),
            _ => Some(Expr::And(terms)),
        }
    }

    /// Disjunction of every expression; an empty list never matches.
    pub fn any(exprs: Vec<Expr>) -> Expr {
        let mut terms = disjuncts(exprs);
        match terms.len() {
            0 => Expr::AlwaysFalse,
            1 => terms.swap_remove(0),
            _ => Expr::Or(terms),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::And(terms) | Expr::Or(terms) => {
                1 + terms.iter().map(Expr::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    pub fn validate_depth(&self) -> DataResult<()> {
        let depth = self.depth();
        if depth > MAX_EXPR_DEPTH {
            return Err(DataError::usage(format!(
                "expression depth {depth} exceeds maximum allowed depth of {MAX_EXPR_DEPTH}"
            )));
        }
        Ok(())
    }

    pub fn is_always_false(&self) -> bool {
        match self {
            Expr::AlwaysFalse => true,
            Expr::In(_, values) => values.is_empty(),
            Expr::And(terms) => terms.iter().any(Expr::is_always_false),
            Expr::Or(terms) => terms.iter().all(Expr::is_always_false),
            _ => false,
        }
    }

    /// Partition keys the predicate pins `column` to, if any.
    ///
    /// `Some(keys)` means every matching row has its partition key in `keys`;
    /// `None` means the predicate does not bound the column.
    pub fn partition_keys(&self, column: &str) -> Option<BTreeSet<i64>> {
        match self {
            Expr::Eq(c, v) if c.eq_ignore_ascii_case(column) => {
                v.as_i64().map(|k| BTreeSet::from([k]))
            }
            Expr::In(c, values) if c.eq_ignore_ascii_case(column) => {
                values.iter().map(Value::as_i64).collect()
            }
            Expr::AlwaysFalse => Some(BTreeSet::new()),
            Expr::And(terms) => terms.iter().fold(None, |bound, term| {
                match (bound, term.partition_keys(column)) {
                    (Some(a), Some(b)) => Some(a.intersection(&b).copied().collect()),
                    (Some(keys), None) | (None, Some(keys)) => Some(keys),
                    (None, None) => None,
                }
            }),
            Expr::Or(terms) => {
                let mut keys = BTreeSet::new();
                for term in terms {
                    keys.extend(term.partition_keys(column)?);
                }
                Some(keys)
            }
            _ => None,
        }
    }

    pub fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Expr::Eq(c, v) => render_binary(sql, params, c, "=", v),
            Expr::Ne(c, v) => render_binary(sql, params, c, "<>", v),
            Expr::Lt(c, v) => render_binary(sql, params, c, "<", v),
            Expr::Lte(c, v) => render_binary(sql, params, c, "<=", v),
            Expr::Gt(c, v) => render_binary(sql, params, c, ">", v),
            Expr::Gte(c, v) => render_binary(sql, params, c, ">=", v),
            Expr::In(c, values) | Expr::NotIn(c, values) => {
                let negated = matches!(self, Expr::NotIn(..));
                if values.is_empty() {
                    // Empty lists are not valid SQL.
                    sql.push_str(if negated { "1 = 1" } else { "1 = 0" });
                    return;
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                let keyword = if negated { "NOT IN" } else { "IN" };
                let _ = write!(sql, "{c} {keyword} ({placeholders})");
                params.extend(values.iter().cloned());
            }
            Expr::IsNull(c) => {
                let _ = write!(sql, "{c} IS NULL");
            }
            Expr::IsNotNull(c) => {
                let _ = write!(sql, "{c} IS NOT NULL");
            }
            Expr::Like(c, pattern) => {
                let _ = write!(sql, "{c} LIKE ?");
                params.push(Value::from(pattern.as_str()));
            }
            Expr::And(terms) => render_joined(sql, params, terms, " AND "),
            Expr::Or(terms) => render_joined(sql, params, terms, " OR "),
            Expr::AlwaysFalse => sql.push_str("1 = 0"),
        }
    }
}

fn conjuncts(exprs: impl IntoIterator<Item = Expr>) -> Vec<Expr> {
    exprs
        .into_iter()
        .flat_map(|expr| match expr {
            Expr::And(terms) => terms,
            other => vec![other],
        })
        .collect()
}

fn disjuncts(exprs: impl IntoIterator<Item = Expr>) -> Vec<Expr> {
    exprs
        .into_iter()
        .flat_map(|expr| match expr {
            Expr::Or(terms) => terms,
            other => vec![other],
        })
        .collect()
}

fn render_joined(sql: &mut String, params: &mut Vec<Value>, terms: &[Expr], separator: &str) {
    sql.push('(');
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            sql.push_str(separator);
        }
        term.render(sql, params);
    }
    sql.push(')');
}

fn render_binary(sql: &mut String, params: &mut Vec<Value>, column: &str, op: &str, value: &Value) {
    let _ = write!(sql, "{column} {op} ?");
    params.push(value.clone());
}

pub fn col(name: impl Into<String>) -> ColumnRef {
    ColumnRef(name.into())
}

/// Helper for building expressions: `col("name").eq("Jaws")`.
#[derive(Debug, Clone)]
pub struct ColumnRef(String);

impl ColumnRef {
    pub fn eq(self, value: impl Into<Value>) -> Expr {
        Expr::Eq(self.0, value.into())
    }

    pub fn ne(self, value: impl Into<Value>) -> Expr {
        Expr::Ne(self.0, value.into())
    }

    pub fn lt(self, value: impl Into<Value>) -> Expr {
        Expr::Lt(self.0, value.into())
    }

    pub fn lte(self, value: impl Into<Value>) -> Expr {
        Expr::Lte(self.0, value.into())
    }

    pub fn gt(self, value: impl Into<Value>) -> Expr {
        Expr::Gt(self.0, value.into())
    }

    pub fn gte(self, value: impl Into<Value>) -> Expr {
        Expr::Gte(self.0, value.into())
    }

    pub fn in_list<I, V>(self, values: I) -> Expr
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Expr::In(self.0, values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(self.0)
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(self.0)
    }

    pub fn like(self, pattern: impl Into<String>) -> Expr {
        Expr::Like(self.0, pattern.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Select(Vec<String>),
    Count,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: String,
    pub predicate: Option<Expr>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub hints: Vec<String>,
}

impl Statement {
    pub fn select<S: Into<String>>(columns: impl IntoIterator<Item = S>, table: impl Into<String>) -> Self {
        Self::new(
            StatementKind::Select(columns.into_iter().map(Into::into).collect()),
            table,
        )
    }

    pub fn count(table: impl Into<String>) -> Self {
        Self::new(StatementKind::Count, table)
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(StatementKind::Delete, table)
    }

    fn new(kind: StatementKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            hints: Vec::new(),
        }
    }

    pub fn where_(mut self, predicate: Option<Expr>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn order_by(mut self, order_by: Vec<(String, Order)>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        for hint in &self.hints {
            let _ = write!(sql, "/* {} */ ", hint.replace("*/", ""));
        }
        match &self.kind {
            StatementKind::Select(columns) => {
                let _ = write!(sql, "SELECT {} FROM {}", columns.join(", "), self.table);
            }
            StatementKind::Count => {
                let _ = write!(sql, "SELECT COUNT(*) FROM {}", self.table);
            }
            StatementKind::Delete => {
                let _ = write!(sql, "DELETE FROM {}", self.table);
            }
        }
        if let Some(predicate) = &self.predicate {
            sql.push_str(" WHERE ");
            predicate.render(&mut sql, &mut params);
        }
        if matches!(self.kind, StatementKind::Select(_)) {
            if !self.order_by.is_empty() {
                let order = self
                    .order_by
                    .iter()
                    .map(|(c, o)| match o {
                        Order::Asc => format!("{c} ASC"),
                        Order::Desc => format!("{c} DESC"),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(sql, " ORDER BY {order}");
            }
            match (self.limit, self.offset) {
                (Some(limit), 0) => {
                    let _ = write!(sql, " LIMIT {limit}");
                }
                (Some(limit), offset) => {
                    let _ = write!(sql, " LIMIT {limit} OFFSET {offset}");
                }
                (None, 0) => {}
                (None, offset) => {
                    let _ = write!(sql, " LIMIT -1 OFFSET {offset}");
                }
            }
        }
        (sql, params)
    }
}
