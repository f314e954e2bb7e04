use crate::error::{DataError, DataResult};
use crate::types::{FromValue, Row, RowDecodeError, Value};
use rand::Rng;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

pub struct Id<T> {
    raw: i64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub const fn new(raw: i64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> i64 {
        self.raw
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.raw)
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl<T> From<Id<T>> for Value {
    fn from(id: Id<T>) -> Self {
        Value::Integer(id.raw)
    }
}

impl<T> FromValue for Id<T> {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        i64::from_value(value, column).map(Id::new)
    }
}

/// Composite id of a partition child: the root it belongs to plus its own id.
pub struct Gid<R, T> {
    pub root: Id<R>,
    pub id: Id<T>,
}

impl<R, T> Gid<R, T> {
    pub const fn new(root: Id<R>, id: Id<T>) -> Self {
        Self { root, id }
    }
}

impl<R, T> Clone for Gid<R, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, T> Copy for Gid<R, T> {}

impl<R, T> PartialEq for Gid<R, T> {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.id == other.id
    }
}

impl<R, T> Eq for Gid<R, T> {}

impl<R, T> fmt::Debug for Gid<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({}/{})", self.root.raw(), self.id.raw())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Bounded data living in one database; the id alone loads it.
    Unsharded,
    PartitionRoot,
    /// Owned by one root and stored next to it. `root_column` holds the root id.
    PartitionChild { root_column: &'static str },
}

/// A persisted record type.
///
/// `COLUMNS` lists the table columns in the order used by `to_values` and
/// `from_row`; the first column is always `id`.
pub trait DbEntity: Sized + 'static {
    const TABLE: &'static str;
    const KEYSPACE: &'static str;
    const KIND: EntityKind;
    const COLUMNS: &'static [&'static str];
    const VERSION_COLUMN: Option<&'static str> = None;

    fn id(&self) -> Option<Id<Self>>;
    fn set_id(&mut self, id: Id<Self>);
    fn to_values(&self) -> Vec<Value>;
    fn from_row(row: &Row) -> Result<Self, RowDecodeError>;

    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}
}

pub trait DbChild: DbEntity {
    type Root: DbEntity;

    fn root_id(&self) -> Id<Self::Root>;

    fn gid(&self) -> Option<Gid<Self::Root, Self>> {
        self.id().map(|id| Gid::new(self.root_id(), id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub keyspace: &'static str,
    pub kind: EntityKind,
    pub columns: &'static [&'static str],
    pub version_column: Option<&'static str>,
}

impl EntityMeta {
    pub fn of<E: DbEntity>() -> Self {
        Self {
            name: short_type_name::<E>(),
            table: E::TABLE,
            keyspace: E::KEYSPACE,
            kind: E::KIND,
            columns: E::COLUMNS,
            version_column: E::VERSION_COLUMN,
        }
    }

    pub fn partition_column(&self) -> Option<&'static str> {
        match self.kind {
            EntityKind::Unsharded => None,
            EntityKind::PartitionRoot => Some("id"),
            EntityKind::PartitionChild { root_column } => Some(root_column),
        }
    }

    /// Maps a dotted path onto a declared column: `release.date` is `release_date`.
    pub fn resolve(&self, path: &str) -> DataResult<&'static str> {
        let column = path_to_column(path);
        self.columns
            .iter()
            .copied()
            .find(|c| c.eq_ignore_ascii_case(&column))
            .ok_or_else(|| {
                DataError::usage(format!(
                    "path '{path}' does not name a column of {}",
                    self.table
                ))
            })
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.columns.first().copied() != Some("id") {
            problems.push(format!("{} must declare id as its first column", self.name));
        }
        if let EntityKind::PartitionChild { root_column } = self.kind
            && self.column_index(root_column).is_none()
        {
            problems.push(format!(
                "{} root column '{root_column}' is not a declared column",
                self.name
            ));
        }
        if let Some(version) = self.version_column
            && self.column_index(version).is_none()
        {
            problems.push(format!(
                "{} version column '{version}' is not a declared column",
                self.name
            ));
        }
        if !is_valid_identifier(self.table) {
            problems.push(format!("{} table name '{}' is not valid", self.name, self.table));
        }
        for column in self.columns {
            if !is_valid_identifier(column) {
                problems.push(format!("{} column '{column}' is not valid", self.name));
            }
        }
        problems
    }
}

pub fn validate_entity<E: DbEntity>() -> DataResult<()> {
    let meta = EntityMeta::of::<E>();
    let problems = meta.problems();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DataError::usage(format!(
            "entity {} is not valid: {}",
            meta.name,
            problems.join("; ")
        )))
    }
}

pub fn path_to_column(path: &str) -> String {
    path.replace('.', "_")
}

/// `\w+(\.\w+)*`
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(is_valid_identifier)
}

fn is_valid_identifier(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_alphanumeric() || c == '_')
}

pub(crate) fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, table: &str) -> i64;
}

#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self, _table: &str) -> i64 {
        rand::thread_rng().gen_range(1..i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DbEntity, EntityKind, EntityMeta, Id, IdGenerator, RandomIdGenerator, is_valid_path,
        path_to_column, validate_entity,
    };
    use crate::types::{Row, RowDecodeError, Value, i64_at};

    struct Broken {
        id: Option<Id<Broken>>,
    }

    impl DbEntity for Broken {
        const TABLE: &'static str = "broken";
        const KEYSPACE: &'static str = "ks";
        const KIND: EntityKind = EntityKind::PartitionChild {
            root_column: "owner_id",
        };
        const COLUMNS: &'static [&'static str] = &["name", "id"];
        const VERSION_COLUMN: Option<&'static str> = Some("version");

        fn id(&self) -> Option<Id<Self>> {
            self.id
        }

        fn set_id(&mut self, id: Id<Self>) {
            self.id = Some(id);
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::Null, self.id.into()]
        }

        fn from_row(row: &Row) -> Result<Self, RowDecodeError> {
            Ok(Self {
                id: Some(Id::new(i64_at(row, 1, "id")?)),
            })
        }
    }

    #[test]
    fn paths_follow_word_pattern() {
        assert!(is_valid_path("name"));
        assert!(is_valid_path("release.date"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("release..date"));
        assert!(!is_valid_path("name!"));
        assert!(!is_valid_path(".name"));
        assert_eq!(path_to_column("release.date"), "release_date");
    }

    #[test]
    fn entity_problems_are_listed_together() {
        let problems = EntityMeta::of::<Broken>().problems();
        assert_eq!(problems.len(), 3, "{problems:?}");
        let err = validate_entity::<Broken>().expect_err("invalid entity");
        assert!(err.is_usage());
    }

    #[test]
    fn ids_are_ordered_and_typed() {
        let a: Id<Broken> = Id::new(3);
        let b: Id<Broken> = Id::new(7);
        assert!(a < b);
        assert_eq!(format!("{a:?}"), "Id(3)");
        assert_eq!(Value::from(b), Value::Integer(7));
    }

    #[test]
    fn random_ids_are_positive() {
        let generator = RandomIdGenerator;
        for _ in 0..100 {
            assert!(generator.next_id("movies") > 0);
        }
    }
}
