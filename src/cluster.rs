use crate::config::DataSourceConfig;
use crate::error::{DataError, DataResult};
use crate::shard::{Keyspace, Shard, TabletType};
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A connection checked out of a provider. The id is stable for the life of
/// the physical connection so retries can tell whether they got the same one.
pub struct PooledConnection {
    id: u64,
    shard: Shard,
    tablet: TabletType,
    conn: Connection,
}

impl PooledConnection {
    pub fn new(id: u64, shard: Shard, tablet: TabletType, conn: Connection) -> Self {
        Self {
            id,
            shard,
            tablet,
            conn,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn tablet(&self) -> TabletType {
        self.tablet
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("tablet", &self.tablet)
            .finish()
    }
}

pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_partitioned(&self) -> bool;

    fn open(&self, shard: &Shard, tablet: TabletType) -> DataResult<PooledConnection>;

    /// Returns a connection. Connections with an open transaction are discarded.
    fn release(&self, conn: PooledConnection);

    fn discover_shards(&self) -> DataResult<BTreeSet<Shard>>;

    /// Whether the bookkeeping table can be read per shard.
    fn supports_migration_tracking(&self) -> bool {
        true
    }
}

/// SQLite files laid out as a cluster: one file per shard, or a single file
/// when the data source is not partitioned.
pub struct SqliteCluster {
    name: String,
    partitioned: bool,
    files: BTreeMap<Shard, PathBuf>,
    busy_timeout: Duration,
    pool_max_idle: usize,
    idle: Mutex<HashMap<(Shard, TabletType), Vec<PooledConnection>>>,
    next_id: AtomicU64,
}

impl SqliteCluster {
    pub fn open(config: &DataSourceConfig) -> DataResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let mut files = BTreeMap::new();
        if config.is_partitioned() {
            for keyspace in &config.keyspaces {
                for shard in keyspace.shard_list()? {
                    let file = format!("{}_{}.sqlite", shard.keyspace, shard.range);
                    files.insert(shard, config.data_dir.join(file));
                }
            }
        } else {
            files.insert(
                Shard::single_shard(),
                config.data_dir.join(format!("{}.sqlite", config.name)),
            );
        }

        let cluster = Self {
            name: config.name.clone(),
            partitioned: config.is_partitioned(),
            files,
            busy_timeout: config.busy_timeout(),
            pool_max_idle: config.pool_max_idle,
            idle: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        // Create every file up front so replicas can open read-only.
        for shard in cluster.files.keys() {
            let conn = cluster.open(shard, TabletType::Primary)?;
            cluster.release(conn);
        }
        info!(
            name = %cluster.name,
            partitioned = cluster.partitioned,
            shards = cluster.files.len(),
            "sqlite cluster opened"
        );
        Ok(cluster)
    }

    pub fn file_for(&self, shard: &Shard) -> Option<&PathBuf> {
        self.files.get(shard)
    }

    fn connect(&self, shard: &Shard, tablet: TabletType) -> DataResult<Connection> {
        let path = self.files.get(shard).ok_or_else(|| {
            DataError::usage(format!("shard {shard} is not part of data source {}", self.name))
        })?;
        let conn = match tablet {
            TabletType::Primary => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                conn
            }
            TabletType::Replica => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl ConnectionProvider for SqliteCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    fn open(&self, shard: &Shard, tablet: TabletType) -> DataResult<PooledConnection> {
        if let Some(conn) = self
            .idle
            .lock()
            .get_mut(&(shard.clone(), tablet))
            .and_then(Vec::pop)
        {
            return Ok(conn);
        }
        let conn = self.connect(shard, tablet)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, %shard, %tablet, "opened connection");
        Ok(PooledConnection::new(id, shard.clone(), tablet, conn))
    }

    fn release(&self, conn: PooledConnection) {
        if !conn.conn.is_autocommit() {
            warn!(id = conn.id, shard = %conn.shard, "discarding connection with an open transaction");
            return;
        }
        if conn.conn.execute_batch("PRAGMA query_only = OFF;").is_err() {
            return;
        }
        let mut idle = self.idle.lock();
        let slot = idle.entry((conn.shard.clone(), conn.tablet)).or_default();
        if slot.len() < self.pool_max_idle {
            slot.push(conn);
        }
    }

    fn discover_shards(&self) -> DataResult<BTreeSet<Shard>> {
        let mut shards = BTreeSet::new();
        for shard in self.files.keys() {
            let reachable = self
                .connect(shard, TabletType::Primary)
                .and_then(|c| c.query_row("SELECT 1", [], |_| Ok(())).map_err(DataError::from));
            match reachable {
                Ok(()) => {
                    shards.insert(shard.clone());
                }
                Err(e) => warn!(%shard, error = %e, "shard unreachable during discovery"),
            }
        }
        if shards.is_empty() {
            return Err(DataError::ConnectionLost(format!(
                "no shards reachable for data source {}",
                self.name
            )));
        }
        Ok(shards)
    }
}

#[derive(Default)]
struct FetchState {
    cached: Option<(Instant, Arc<BTreeSet<Shard>>)>,
    last: Option<Result<Arc<BTreeSet<Shard>>, String>>,
    in_flight: bool,
    generation: u64,
}

struct FetchShared {
    state: Mutex<FetchState>,
    ready: Condvar,
    fetches: AtomicU64,
}

/// Caches the shard list of a partitioned provider. Fetches run on one
/// dedicated thread; concurrent misses wait for the same fetch.
pub struct ShardListFetcher {
    provider: Arc<dyn ConnectionProvider>,
    ttl: Duration,
    shared: Arc<FetchShared>,
    requests: Option<Mutex<mpsc::Sender<()>>>,
}

impl ShardListFetcher {
    pub fn new(provider: Arc<dyn ConnectionProvider>, ttl: Duration) -> DataResult<Self> {
        let shared = Arc::new(FetchShared {
            state: Mutex::new(FetchState::default()),
            ready: Condvar::new(),
            fetches: AtomicU64::new(0),
        });
        if !provider.is_partitioned() {
            return Ok(Self {
                provider,
                ttl,
                shared,
                requests: None,
            });
        }

        let (tx, rx) = mpsc::channel::<()>();
        let worker_provider = Arc::clone(&provider);
        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(format!("{}-shard-list", provider.name()))
            .spawn(move || {
                while rx.recv().is_ok() {
                    worker_shared.fetches.fetch_add(1, Ordering::Relaxed);
                    let result = worker_provider.discover_shards();
                    let mut state = worker_shared.state.lock();
                    match result {
                        Ok(shards) => {
                            info!(shards = shards.len(), "fetched shard list");
                            let shards = Arc::new(shards);
                            state.cached = Some((Instant::now(), Arc::clone(&shards)));
                            state.last = Some(Ok(shards));
                        }
                        Err(e) => {
                            warn!(error = %e, "shard list fetch failed");
                            state.last = Some(Err(e.to_string()));
                        }
                    }
                    state.in_flight = false;
                    state.generation += 1;
                    worker_shared.ready.notify_all();
                }
            })?;

        Ok(Self {
            provider,
            ttl,
            shared,
            requests: Some(Mutex::new(tx)),
        })
    }

    pub fn shards(&self) -> DataResult<Arc<BTreeSet<Shard>>> {
        let Some(requests) = &self.requests else {
            return Ok(Arc::new(BTreeSet::from([Shard::single_shard()])));
        };

        let mut state = self.shared.state.lock();
        if let Some((fetched_at, shards)) = &state.cached
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(shards));
        }
        if !state.in_flight {
            requests.lock().send(()).map_err(|_| {
                DataError::ConnectionLost(format!(
                    "shard list fetcher for {} has stopped",
                    self.provider.name()
                ))
            })?;
            state.in_flight = true;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.shared.ready.wait(&mut state);
        }
        match &state.last {
            Some(Ok(shards)) => Ok(Arc::clone(shards)),
            Some(Err(message)) => Err(DataError::ConnectionLost(message.clone())),
            None => Err(DataError::ConnectionLost("shard list unavailable".into())),
        }
    }

    pub fn shards_in(&self, keyspace: &Keyspace) -> DataResult<Vec<Shard>> {
        let shards = self.shards()?;
        if self.requests.is_none() {
            return Ok(shards.iter().cloned().collect());
        }
        Ok(shards
            .iter()
            .filter(|s| &s.keyspace == keyspace)
            .cloned()
            .collect())
    }

    pub fn invalidate(&self) {
        self.shared.state.lock().cached = None;
    }

    pub fn fetch_count(&self) -> u64 {
        self.shared.fetches.load(Ordering::Relaxed)
    }
}
