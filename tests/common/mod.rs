#![allow(dead_code)]

use shardwise::shard::keyspace_id;
use shardwise::types::{FromValue, value_at};
use shardwise::{
    Args, DataError, DataResult, DataSourceConfig, Database, DbChild, DbEntity, EntityKind, Id,
    KeyRange, KeyspaceConfig, MemoryResourceLoader, Operator, Projection, ProjectionDecl,
    QueryDeclaration, QueryExecutor, QueryInterface, ResultKind, ReturnShape, Row, RowDecodeError,
    Session, Value,
};
use std::path::Path;
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const ACTORS_SQL: &str = "CREATE TABLE actors (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  birth_year INTEGER
);
CREATE INDEX idx_actors_name ON actors (name);";

pub const MOVIES_SQL: &str = "CREATE TABLE movies (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  release_date INTEGER,
  rating INTEGER,
  version INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_movies_name ON movies (name);
CREATE INDEX idx_movies_release_date ON movies (release_date);
CREATE TABLE characters (
  id INTEGER PRIMARY KEY,
  movie_id INTEGER NOT NULL,
  name TEXT NOT NULL,
  actor_id INTEGER
);
CREATE INDEX idx_characters_movie ON characters (movie_id, name);
CREATE INDEX idx_characters_name ON characters (name);";

pub fn migrations() -> MemoryResourceLoader {
    MemoryResourceLoader::new()
        .with("migrations/actors/v1001__actors.sql", ACTORS_SQL)
        .with("migrations/movies/v1002__movies.sql", MOVIES_SQL)
}

fn fast_retries(mut config: DataSourceConfig) -> DataSourceConfig {
    config.retry.min_retry_delay_ms = 1;
    config.retry.max_retry_delay_ms = 5;
    config.retry.retry_jitter_ms = 1;
    config
}

/// Every keyspace in one database file.
pub fn development_config(dir: &Path) -> DataSourceConfig {
    let mut config = DataSourceConfig::development(dir).with_keyspace_migrations_root("migrations");
    config.keyspaces = vec![
        KeyspaceConfig::unsharded("actors"),
        KeyspaceConfig::unsharded("movies"),
    ];
    fast_retries(config)
}

/// `movies` split in two halves, `actors` on a single shard.
pub fn sharded_config(dir: &Path) -> DataSourceConfig {
    let config = DataSourceConfig::sharded(
        dir,
        vec![
            KeyspaceConfig::unsharded("actors"),
            KeyspaceConfig::sharded("movies", ["-80", "80-"]),
        ],
    )
    .with_keyspace_migrations_root("migrations");
    fast_retries(config)
}

pub fn open_migrated(config: DataSourceConfig) -> Database {
    init_tracing();
    let db = Database::open_with(config, Arc::new(migrations()), None).expect("open database");
    db.migrate("tests").expect("migrate");
    db
}

/// The first `count` positive ids whose keyspace id falls in `range`.
pub fn ids_in(range: &str, count: usize) -> Vec<i64> {
    let range = KeyRange::parse(range).expect("range");
    (1i64..)
        .filter(|id| range.contains(keyspace_id(*id)))
        .take(count)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbActor {
    pub id: Option<Id<DbActor>>,
    pub name: String,
    pub birth_year: Option<i64>,
}

impl DbActor {
    pub fn new(name: &str, birth_year: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            birth_year,
        }
    }
}

impl DbEntity for DbActor {
    const TABLE: &'static str = "actors";
    const KEYSPACE: &'static str = "actors";
    const KIND: EntityKind = EntityKind::Unsharded;
    const COLUMNS: &'static [&'static str] = &["id", "name", "birth_year"];

    fn id(&self) -> Option<Id<Self>> {
        self.id
    }

    fn set_id(&mut self, id: Id<Self>) {
        self.id = Some(id);
    }

    fn to_values(&self) -> Vec<Value> {
        vec![self.id.into(), self.name.as_str().into(), self.birth_year.into()]
    }

    fn from_row(row: &Row) -> Result<Self, RowDecodeError> {
        Ok(Self {
            id: Some(value_at(row, 0, "id")?),
            name: value_at(row, 1, "name")?,
            birth_year: value_at(row, 2, "birth_year")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbMovie {
    pub id: Option<Id<DbMovie>>,
    pub name: String,
    pub release_date: Option<i64>,
    pub rating: Option<i64>,
    pub version: i64,
}

impl DbMovie {
    pub fn new(name: &str, release_date: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            release_date,
            rating: None,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(Id::new(id));
        self
    }

    pub fn rated(mut self, rating: i64) -> Self {
        self.rating = Some(rating);
        self
    }
}

impl DbEntity for DbMovie {
    const TABLE: &'static str = "movies";
    const KEYSPACE: &'static str = "movies";
    const KIND: EntityKind = EntityKind::PartitionRoot;
    const COLUMNS: &'static [&'static str] = &["id", "name", "release_date", "rating", "version"];
    const VERSION_COLUMN: Option<&'static str> = Some("version");

    fn id(&self) -> Option<Id<Self>> {
        self.id
    }

    fn set_id(&mut self, id: Id<Self>) {
        self.id = Some(id);
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.name.as_str().into(),
            self.release_date.into(),
            self.rating.into(),
            self.version.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self, RowDecodeError> {
        Ok(Self {
            id: Some(value_at(row, 0, "id")?),
            name: value_at(row, 1, "name")?,
            release_date: value_at(row, 2, "release_date")?,
            rating: value_at(row, 3, "rating")?,
            version: value_at(row, 4, "version")?,
        })
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbCharacter {
    pub id: Option<Id<DbCharacter>>,
    pub movie_id: Id<DbMovie>,
    pub name: String,
    pub actor_id: Option<Id<DbActor>>,
}

impl DbCharacter {
    pub fn new(movie_id: Id<DbMovie>, name: &str) -> Self {
        Self {
            id: None,
            movie_id,
            name: name.to_string(),
            actor_id: None,
        }
    }
}

impl DbEntity for DbCharacter {
    const TABLE: &'static str = "characters";
    const KEYSPACE: &'static str = "movies";
    const KIND: EntityKind = EntityKind::PartitionChild {
        root_column: "movie_id",
    };
    const COLUMNS: &'static [&'static str] = &["id", "movie_id", "name", "actor_id"];

    fn id(&self) -> Option<Id<Self>> {
        self.id
    }

    fn set_id(&mut self, id: Id<Self>) {
        self.id = Some(id);
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.id.into(),
            self.movie_id.into(),
            self.name.as_str().into(),
            self.actor_id.into(),
        ]
    }

    fn from_row(row: &Row) -> Result<Self, RowDecodeError> {
        Ok(Self {
            id: Some(value_at(row, 0, "id")?),
            movie_id: value_at(row, 1, "movie_id")?,
            name: value_at(row, 2, "name")?,
            actor_id: value_at(row, 3, "actor_id")?,
        })
    }
}

impl DbChild for DbCharacter {
    type Root = DbMovie;

    fn root_id(&self) -> Id<DbMovie> {
        self.movie_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameAndReleaseDate {
    pub name: String,
    pub release_date: Option<i64>,
}

impl Projection for NameAndReleaseDate {
    fn declaration() -> ProjectionDecl {
        ProjectionDecl::new("NameAndReleaseDate")
            .property("name")
            .property("release.date")
    }

    fn from_values(values: Vec<Value>) -> Result<Self, RowDecodeError> {
        let [name, release_date]: [Value; 2] =
            values.try_into().map_err(|values: Vec<Value>| RowDecodeError::Custom {
                message: format!("expected 2 values, got {}", values.len()),
            })?;
        Ok(Self {
            name: String::from_value(name, "name")?,
            release_date: Option::<i64>::from_value(release_date, "release_date")?,
        })
    }
}

fn strings(values: Vec<Value>, column: &str) -> DataResult<Vec<String>> {
    values
        .into_iter()
        .map(|value| String::from_value(value, column).map_err(DataError::from))
        .collect()
}

pub struct MovieQuery(QueryExecutor<DbMovie>);

impl QueryInterface for MovieQuery {
    type Entity = DbMovie;

    fn declare() -> QueryDeclaration {
        QueryDeclaration::new("MovieQuery")
            .constraint("id", "id", Operator::Eq)
            .constraint("id_in", "id", Operator::In)
            .constraint("name", "name", Operator::Eq)
            .constraint("release_date_before", "release.date", Operator::Lt)
            .constraint("release_date_missing", "release.date", Operator::IsNull)
            .constraint("rating_above", "rating", Operator::Gt)
            .order("release_date_asc", "release.date", true)
            .order("release_date_desc", "release.date", false)
            .order("name_asc", "name", true)
            .select(
                "names",
                "name",
                ReturnShape::list_of(ResultKind::Value("String".into())),
            )
            .select(
                "name_and_release_date",
                "",
                ReturnShape::list_of(ResultKind::Projection(NameAndReleaseDate::declaration())),
            )
            .select(
                "unique_name_and_release_date",
                "",
                ReturnShape::nullable(ResultKind::Projection(NameAndReleaseDate::declaration())),
            )
    }

    fn from_executor(executor: QueryExecutor<DbMovie>) -> Self {
        Self(executor)
    }

    fn executor(&self) -> &QueryExecutor<DbMovie> {
        &self.0
    }

    fn executor_mut(&mut self) -> &mut QueryExecutor<DbMovie> {
        &mut self.0
    }
}

impl MovieQuery {
    pub fn id(self, id: Id<DbMovie>) -> Self {
        self.call("id", Args::value(id))
    }

    pub fn id_in(self, ids: &[Id<DbMovie>]) -> Self {
        self.call("id_in", Args::values(ids.iter().copied()))
    }

    pub fn name(self, name: &str) -> Self {
        self.call("name", Args::value(name))
    }

    pub fn release_date_before(self, year: i64) -> Self {
        self.call("release_date_before", Args::value(year))
    }

    pub fn release_date_missing(self) -> Self {
        self.call("release_date_missing", Args::none())
    }

    pub fn rating_above(self, rating: i64) -> Self {
        self.call("rating_above", Args::value(rating))
    }

    pub fn release_date_asc(self) -> Self {
        self.call("release_date_asc", Args::none())
    }

    pub fn release_date_desc(self) -> Self {
        self.call("release_date_desc", Args::none())
    }

    pub fn name_asc(self) -> Self {
        self.call("name_asc", Args::none())
    }

    pub fn names(&self, session: &mut Session) -> DataResult<Vec<String>> {
        strings(self.0.select_values(session, "names")?, "name")
    }

    pub fn name_and_release_date(&self, session: &mut Session) -> DataResult<Vec<NameAndReleaseDate>> {
        self.0.select_list(session, "name_and_release_date")
    }

    pub fn unique_name_and_release_date(
        &self,
        session: &mut Session,
    ) -> DataResult<Option<NameAndReleaseDate>> {
        self.0.select_unique(session, "unique_name_and_release_date")
    }
}

pub struct ActorQuery(QueryExecutor<DbActor>);

impl QueryInterface for ActorQuery {
    type Entity = DbActor;

    fn declare() -> QueryDeclaration {
        QueryDeclaration::new("ActorQuery")
            .constraint("name", "name", Operator::Eq)
            .constraint("name_in", "name", Operator::In)
            .constraint("born_after", "birth_year", Operator::Gt)
            .order("name_asc", "name", true)
    }

    fn from_executor(executor: QueryExecutor<DbActor>) -> Self {
        Self(executor)
    }

    fn executor(&self) -> &QueryExecutor<DbActor> {
        &self.0
    }

    fn executor_mut(&mut self) -> &mut QueryExecutor<DbActor> {
        &mut self.0
    }
}

impl ActorQuery {
    pub fn name(self, name: &str) -> Self {
        self.call("name", Args::value(name))
    }

    pub fn name_in(self, names: &[&str]) -> Self {
        self.call("name_in", Args::values(names.iter().copied()))
    }

    pub fn born_after(self, year: i64) -> Self {
        self.call("born_after", Args::value(year))
    }

    pub fn name_asc(self) -> Self {
        self.call("name_asc", Args::none())
    }
}

pub struct CharacterQuery(QueryExecutor<DbCharacter>);

impl QueryInterface for CharacterQuery {
    type Entity = DbCharacter;

    fn declare() -> QueryDeclaration {
        QueryDeclaration::new("CharacterQuery")
            .constraint("movie_id", "movie.id", Operator::Eq)
            .constraint("name", "name", Operator::Eq)
            .order("name_asc", "name", true)
            .select(
                "names",
                "name",
                ReturnShape::list_of(ResultKind::Value("String".into())),
            )
    }

    fn from_executor(executor: QueryExecutor<DbCharacter>) -> Self {
        Self(executor)
    }

    fn executor(&self) -> &QueryExecutor<DbCharacter> {
        &self.0
    }

    fn executor_mut(&mut self) -> &mut QueryExecutor<DbCharacter> {
        &mut self.0
    }
}

impl CharacterQuery {
    pub fn movie_id(self, id: Id<DbMovie>) -> Self {
        self.call("movie_id", Args::value(id))
    }

    pub fn name(self, name: &str) -> Self {
        self.call("name", Args::value(name))
    }

    pub fn name_asc(self) -> Self {
        self.call("name_asc", Args::none())
    }

    pub fn names(&self, session: &mut Session) -> DataResult<Vec<String>> {
        strings(self.0.select_values(session, "names")?, "name")
    }
}
