use crate::checks::{Check, CheckSet};
use crate::cluster::{ConnectionProvider, ShardListFetcher};
use crate::config::DataSourceConfig;
use crate::context::CallContext;
use crate::entity::{IdGenerator, RandomIdGenerator};
use crate::error::{DataError, DataResult};
use crate::session::{CloseHook, Session};
use crate::shard::{Keyspace, Shard, TabletType};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const APP_DB_TRANSACTION_SPAN_NAME: &str = "app-db-transaction";
pub const DB_SESSION_SPAN_NAME: &str = "db-session";
pub const DB_BEGIN_SPAN_NAME: &str = "db-begin";
pub const DB_COMMIT_SPAN_NAME: &str = "db-commit";
pub const DB_ROLLBACK_SPAN_NAME: &str = "db-rollback";
pub const DB_SELECT_SPAN_NAME: &str = "db-select";

/// Receives the named spans of each transaction.
pub trait TransactionTracer: Send + Sync {
    fn on_span_start(&self, _name: &'static str) {}

    fn on_span_end(&self, _name: &'static str, _ok: bool) {}
}

pub(crate) fn traced<R>(
    tracer: Option<&Arc<dyn TransactionTracer>>,
    name: &'static str,
    f: impl FnOnce() -> DataResult<R>,
) -> DataResult<R> {
    let Some(tracer) = tracer else {
        return f();
    };
    tracer.on_span_start(name);
    let result = f();
    tracer.on_span_end(name, result.is_ok());
    result
}

pub(crate) struct Shared {
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) fetcher: ShardListFetcher,
    pub(crate) config: DataSourceConfig,
    pub(crate) tracer: Option<Arc<dyn TransactionTracer>>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransacterOptions {
    pub max_attempts: u32,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_jitter: Duration,
    pub read_only: bool,
    pub disabled_checks: CheckSet,
    pub tablet: TabletType,
    pub shard: Option<Shard>,
}

impl TransacterOptions {
    pub fn from_config(config: &DataSourceConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            min_retry_delay: Duration::from_millis(config.retry.min_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.retry.max_retry_delay_ms),
            retry_jitter: Duration::from_millis(config.retry.retry_jitter_ms),
            read_only: false,
            disabled_checks: CheckSet::empty(),
            tablet: TabletType::Primary,
            shard: None,
        }
    }
}

/// Delay before the next retry: `min * 2^retries`, capped at `max`, plus
/// up to `jitter` of random slack.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    pub(crate) fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            min,
            max,
            jitter,
            retries: 0,
        }
    }

    pub(crate) fn next_retry(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        self.retries = self.retries.saturating_add(1);
        let base = self.min.saturating_mul(factor).min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        let slack = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(slack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

pub struct TransacterBuilder {
    provider: Arc<dyn ConnectionProvider>,
    config: DataSourceConfig,
    tracer: Option<Arc<dyn TransactionTracer>>,
    ids: Arc<dyn IdGenerator>,
}

impl TransacterBuilder {
    pub fn tracer(mut self, tracer: Arc<dyn TransactionTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn build(self) -> DataResult<Transacter> {
        let fetcher =
            ShardListFetcher::new(Arc::clone(&self.provider), self.config.shard_cache_ttl())?;
        let options = TransacterOptions::from_config(&self.config);
        Ok(Transacter {
            shared: Arc::new(Shared {
                provider: self.provider,
                fetcher,
                config: self.config,
                tracer: self.tracer,
                ids: self.ids,
            }),
            options,
        })
    }
}

/// Runs work in transactions, retrying recoverable failures. Derived
/// transacters share everything but their options.
#[derive(Clone)]
pub struct Transacter {
    shared: Arc<Shared>,
    options: TransacterOptions,
}

impl Transacter {
    pub fn builder(provider: Arc<dyn ConnectionProvider>, config: DataSourceConfig) -> TransacterBuilder {
        TransacterBuilder {
            provider,
            config,
            tracer: None,
            ids: Arc::new(RandomIdGenerator),
        }
    }

    pub fn new(provider: Arc<dyn ConnectionProvider>, config: DataSourceConfig) -> DataResult<Self> {
        Self::builder(provider, config).build()
    }

    pub fn options(&self) -> &TransacterOptions {
        &self.options
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.shared.config
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.shared.provider
    }

    pub fn is_partitioned(&self) -> bool {
        self.shared.provider.is_partitioned()
    }

    fn derive(&self, change: impl FnOnce(&mut TransacterOptions)) -> Self {
        let mut options = self.options.clone();
        change(&mut options);
        Self {
            shared: Arc::clone(&self.shared),
            options,
        }
    }

    pub fn retries(&self, max_attempts: u32) -> Self {
        self.derive(|o| o.max_attempts = max_attempts.max(1))
    }

    pub fn no_retries(&self) -> Self {
        self.retries(1)
    }

    pub fn retry_delays(&self, min: Duration, max: Duration, jitter: Duration) -> Self {
        self.derive(|o| {
            o.min_retry_delay = min;
            o.max_retry_delay = max;
            o.retry_jitter = jitter;
        })
    }

    pub fn read_only(&self) -> Self {
        self.derive(|o| o.read_only = true)
    }

    pub fn allow_cowrites(&self) -> Self {
        self.disable_checks(&[Check::Cowrite])
    }

    pub fn disable_checks(&self, checks: &[Check]) -> Self {
        let checks = CheckSet::of(checks);
        self.derive(|o| o.disabled_checks = o.disabled_checks.union(checks))
    }

    pub fn is_check_enabled(&self, check: Check) -> bool {
        let configured = match check {
            Check::Cowrite => self.shared.config.checks.cowrite,
            Check::FullScatter => self.shared.config.checks.full_scatter,
            Check::TableScan => self.shared.config.checks.table_scan,
        };
        configured && !self.options.disabled_checks.contains(check)
    }

    pub fn in_transaction(&self, ctx: &CallContext) -> bool {
        ctx.in_transaction()
    }

    pub fn shards(&self) -> DataResult<Arc<BTreeSet<Shard>>> {
        self.shared.fetcher.shards()
    }

    pub fn shards_in(&self, keyspace: &str) -> DataResult<Vec<Shard>> {
        self.shared.fetcher.shards_in(&Keyspace::new(keyspace))
    }

    pub fn refresh_shards(&self) {
        self.shared.fetcher.invalidate();
    }

    pub fn shard_list_fetches(&self) -> u64 {
        self.shared.fetcher.fetch_count()
    }

    pub fn transaction<T>(
        &self,
        ctx: &CallContext,
        work: impl FnMut(&mut Session) -> DataResult<T>,
    ) -> DataResult<T> {
        self.transaction_attempts(ctx, work).map(|a| a.value)
    }

    pub fn transaction_on_shard<T>(
        &self,
        ctx: &CallContext,
        shard: &Shard,
        work: impl FnMut(&mut Session) -> DataResult<T>,
    ) -> DataResult<T> {
        if self.is_partitioned() && !self.shards()?.contains(shard) {
            return Err(DataError::usage(format!("unknown shard {shard}")));
        }
        let shard = shard.clone();
        self.derive(|o| o.shard = Some(shard)).transaction(ctx, work)
    }

    /// Read-only work against replicas. Reads may visit every shard.
    pub fn replica_read<T>(
        &self,
        ctx: &CallContext,
        work: impl FnMut(&mut Session) -> DataResult<T>,
    ) -> DataResult<T> {
        if ctx.in_transaction() {
            return Err(DataError::usage(
                "replica reads cannot run inside a transaction",
            ));
        }
        let partitioned = self.is_partitioned();
        self.derive(|o| {
            o.read_only = true;
            o.disabled_checks = o.disabled_checks.with(Check::FullScatter);
            if partitioned {
                o.tablet = TabletType::Replica;
            }
        })
        .transaction(ctx, work)
    }

    pub fn transaction_attempts<T>(
        &self,
        ctx: &CallContext,
        mut work: impl FnMut(&mut Session) -> DataResult<T>,
    ) -> DataResult<Attempted<T>> {
        traced(self.shared.tracer.as_ref(), APP_DB_TRANSACTION_SPAN_NAME, || {
            let mut backoff = ExponentialBackoff::new(
                self.options.min_retry_delay,
                self.options.max_retry_delay,
                self.options.retry_jitter,
            );
            let mut previous_connection = None;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let (result, connection) = self.attempt(ctx, &mut work);
                let err = match result {
                    Ok(value) => {
                        if attempt > 1 {
                            info!(attempts = attempt, caller = ctx.caller_id(), "retried transaction succeeded");
                        }
                        return Ok(Attempted {
                            value,
                            attempts: attempt,
                        });
                    }
                    Err(err) => err,
                };
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= self.options.max_attempts {
                    warn!(attempts = attempt, error = %err, "transaction failed, out of retries");
                    return Err(err);
                }
                let same_connection = previous_connection.is_some() && previous_connection == connection;
                let delay = backoff.next_retry();
                warn!(
                    attempt,
                    max_attempts = self.options.max_attempts,
                    same_connection,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "recoverable transaction failure, retrying"
                );
                previous_connection = connection;
                std::thread::sleep(delay);
            }
        })
    }

    fn attempt<T>(
        &self,
        ctx: &CallContext,
        work: &mut impl FnMut(&mut Session) -> DataResult<T>,
    ) -> (DataResult<T>, Option<u64>) {
        let guard = match ctx.enter() {
            Ok(guard) => guard,
            Err(e) => return (Err(e), None),
        };
        let mut session = Session::open(
            Arc::clone(&self.shared),
            self.options.clone(),
            ctx.clone(),
            guard,
        );
        let result = traced(self.shared.tracer.as_ref(), DB_SESSION_SPAN_NAME, || {
            run_in_session(&mut session, work)
        });
        let connection = session.first_connection();
        let close_hooks = session.close();
        (run_close_hooks(close_hooks, result), connection)
    }
}

fn run_in_session<T>(
    session: &mut Session,
    work: &mut impl FnMut(&mut Session) -> DataResult<T>,
) -> DataResult<T> {
    let outcome = work(session).and_then(|value| {
        session.run_pre_commit_hooks()?;
        session.commit()?;
        Ok(value)
    });
    match outcome {
        Ok(value) => {
            session.run_post_commit_hooks()?;
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "rolling back transaction");
            session.rollback(&err);
            Err(err)
        }
    }
}

fn run_close_hooks<T>(hooks: Vec<CloseHook>, result: DataResult<T>) -> DataResult<T> {
    let mut result = result;
    for hook in hooks {
        if let Err(e) = hook() {
            match &result {
                Ok(_) => result = Err(e),
                Err(original) => {
                    error!(error = %e, original = %original, "session close hook failed after the transaction failed");
                }
            }
        }
    }
    result
}
