use crate::error::{DataError, DataResult};
use crate::shard::Shard;
use crate::types::Value;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::fmt;

/// Scale-safety checks applied to statements run inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Check {
    Cowrite,
    FullScatter,
    TableScan,
}

impl Check {
    pub const ALL: [Check; 3] = [Check::Cowrite, Check::FullScatter, Check::TableScan];

    fn bit(self) -> u8 {
        match self {
            Check::Cowrite => 1,
            Check::FullScatter => 2,
            Check::TableScan => 4,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Cowrite => f.write_str("COWRITE"),
            Check::FullScatter => f.write_str("FULL_SCATTER"),
            Check::TableScan => f.write_str("TABLE_SCAN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CheckSet(u8);

impl CheckSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(7)
    }

    pub fn of(checks: &[Check]) -> Self {
        checks.iter().fold(Self::empty(), |set, c| set.with(*c))
    }

    pub fn with(self, check: Check) -> Self {
        Self(self.0 | check.bit())
    }

    pub fn union(self, other: CheckSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, check: Check) -> bool {
        self.0 & check.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Check> {
        Check::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Check> for CheckSet {
    fn from_iter<I: IntoIterator<Item = Check>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), CheckSet::with)
    }
}

pub(crate) const MIGRATION_TABLE: &str = "schema_version";

fn leading_keyword(sql: &str) -> String {
    let mut rest = sql.trim_start();
    // Skip leading hint comments.
    while let Some(stripped) = rest.strip_prefix("/*") {
        rest = match stripped.find("*/") {
            Some(end) => stripped[end + 2..].trim_start(),
            None => "",
        };
    }
    rest.split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

pub(crate) fn is_write_statement(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE"
    )
}

fn is_scan_candidate(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "SELECT" | "UPDATE" | "DELETE" | "WITH"
    )
}

/// Returns the first table the query plan reads in full. The migration
/// bookkeeping table is exempt.
pub(crate) fn find_table_scan(
    conn: &Connection,
    sql: &str,
    params: &[Value],
) -> DataResult<Option<String>> {
    if !is_scan_candidate(sql) {
        return Ok(None);
    }
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
    let details = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            row.get::<_, String>(3)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(details.iter().find_map(|detail| scanned_table(detail)))
}

// A `SCAN` reads every row, through the table or through an index.
fn scanned_table(detail: &str) -> Option<String> {
    let rest = detail.strip_prefix("SCAN ")?;
    let rest = rest.strip_prefix("TABLE ").unwrap_or(rest);
    if rest.starts_with("CONSTANT ROW") || rest.starts_with('(') || rest.starts_with("SUBQUERY") {
        return None;
    }
    let table = rest.split_whitespace().next()?;
    if table.eq_ignore_ascii_case(MIGRATION_TABLE) || table.starts_with("sqlite_") {
        return None;
    }
    Some(table.to_string())
}

#[derive(Debug, Default)]
pub(crate) struct CowriteTracker {
    shards: BTreeSet<Shard>,
    groups: BTreeSet<(Shard, i64)>,
}

impl CowriteTracker {
    /// Records a write. With `enforce` set, a write that adds a second shard
    /// or a second entity group fails before it reaches the database.
    pub(crate) fn record(
        &mut self,
        shard: &Shard,
        group: Option<i64>,
        enforce: bool,
    ) -> DataResult<()> {
        if enforce {
            let new_shard = !self.shards.is_empty() && !self.shards.contains(shard);
            if new_shard {
                let existing = self
                    .shards
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DataError::Cowrite {
                    message: format!(
                        "transaction already wrote to {existing} and now writes to {shard}"
                    ),
                });
            }
            if let Some(group) = group
                && let Some((_, existing)) = self
                    .groups
                    .iter()
                    .find(|(s, g)| s == shard && *g != group)
            {
                return Err(DataError::Cowrite {
                    message: format!(
                        "transaction already wrote entity group {existing} and now writes entity group {group} on {shard}"
                    ),
                });
            }
        }
        self.shards.insert(shard.clone());
        if let Some(group) = group {
            self.groups.insert((shard.clone(), group));
        }
        Ok(())
    }

    pub(crate) fn shards_written(&self) -> usize {
        self.shards.len()
    }
}
