use std::env::var;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::apiv1::conn_pool::{self, ConnectionManager, Connector, SPANNER};
use crate::apiv1::types::{DirectedReadOptions, Mutation, QueryOptions as ExecuteQueryOptions};
use crate::batch::{batch_write, commit_mutations, BatchWriteOptions, BatchWriteStream};
use crate::mutation::MutationGroup;
use crate::retry::{invoke, is_session_not_found, Predicate, Retry, TransactionPredicate, TransactionRetrySetting, TryAs};
use crate::session::{ManagedSession, PoolStats, SessionConfig, SessionError, SessionManager};
use crate::statement::Statement;
use crate::transaction::{merge_query_options, CallOptions, QueryOptions, TransactionDefaults};
use crate::transaction_ro::{BatchReadOnlyTransaction, ReadOnlyTransaction};
use crate::transaction_rw::{CommitOptions, CommitResult, ReadWriteOptions, ReadWriteTransaction};
use crate::value::TimestampBound;

/// Maximum number of sessions per gRPC channel.
const SESSIONS_PER_CHANNEL: usize = 100;

#[derive(Clone)]
pub struct PartitionedUpdateOption {
    pub begin_options: CallOptions,
    pub query_options: Option<QueryOptions>,
    pub transaction_retry_setting: TransactionRetrySetting,
    pub exclude_txn_from_change_streams: bool,
}

impl Default for PartitionedUpdateOption {
    fn default() -> Self {
        PartitionedUpdateOption {
            begin_options: CallOptions::default(),
            query_options: None,
            transaction_retry_setting: TransactionRetrySetting::new(vec![Code::Aborted, Code::Internal]),
            exclude_txn_from_change_streams: false,
        }
    }
}

#[derive(Clone)]
pub struct ReadOnlyTransactionOption {
    pub timestamp_bound: TimestampBound,
    pub call_options: CallOptions,
    /// Begins the snapshot with BeginTransaction instead of with the first read.
    pub explicit_begin: bool,
}

impl Default for ReadOnlyTransactionOption {
    fn default() -> Self {
        ReadOnlyTransactionOption {
            timestamp_bound: TimestampBound::strong_read(),
            call_options: CallOptions::default(),
            explicit_begin: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ReadWriteTransactionOption {
    pub transaction_options: ReadWriteOptions,
    pub begin_options: CallOptions,
    pub commit_options: CommitOptions,
    pub transaction_retry_setting: TransactionRetrySetting,
    /// Stops the retry loop. A running attempt is rolled back.
    pub cancel: Option<CancellationToken>,
}

#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub transaction_options: ReadWriteOptions,
    pub transaction_retry_setting: TransactionRetrySetting,
    pub commit_options: CommitOptions,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// num_channels is the number of gRPC channels.
    pub num_channels: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig { num_channels: 4 }
    }
}

/// ClientConfig has configurations for the client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// SessionPoolConfig is the configuration for session pool.
    pub session_config: SessionConfig,
    /// ChannelConfig is the configuration for gRPC connection.
    pub channel_config: ChannelConfig,
    /// Overriding service endpoint
    pub endpoint: String,
    /// Used to build the default endpoint when `endpoint` is not overridden.
    pub universe_domain: Option<String>,
    /// Timeout of each RPC.
    pub default_timeout: Option<Duration>,
    /// Default of `CommitOptions::max_commit_delay`.
    pub max_commit_delay: Option<Duration>,
    /// Sends `x-goog-spanner-route-to-leader` with writes and read-write transactions.
    pub route_to_leader_enabled: bool,
    pub query_options: Option<ExecuteQueryOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
    pub disable_builtin_metrics: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut config = ClientConfig {
            channel_config: Default::default(),
            session_config: Default::default(),
            endpoint: SPANNER.to_string(),
            universe_domain: None,
            default_timeout: None,
            max_commit_delay: None,
            route_to_leader_enabled: true,
            query_options: None,
            directed_read_options: None,
            disable_builtin_metrics: false,
        };
        config.session_config.max_opened = config.channel_config.num_channels * SESSIONS_PER_CHANNEL;
        config
    }
}

impl ClientConfig {
    /// Applies the environment variables. Values already set in the config win over the
    /// optimizer variables.
    pub fn with_env(mut self) -> Self {
        if let Ok(host) = var("SPANNER_EMULATOR_HOST") {
            tracing::debug!("using spanner emulator host={host}");
            self.endpoint = host;
        }
        let version = var("SPANNER_OPTIMIZER_VERSION").unwrap_or_default();
        let package = var("SPANNER_OPTIMIZER_STATISTICS_PACKAGE").unwrap_or_default();
        if !version.is_empty() || !package.is_empty() {
            let from_env = ExecuteQueryOptions {
                optimizer_version: version,
                optimizer_statistics_package: package,
            };
            self.query_options = merge_query_options(self.query_options.take(), Some(&from_env));
        }
        if let Ok(v) = var("SPANNER_DISABLE_BUILTIN_METRICS") {
            self.disable_builtin_metrics = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = var("GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS") {
            self.session_config.multiplexed = v.eq_ignore_ascii_case("true");
            if !self.session_config.multiplexed {
                self.session_config.multiplexed_for_read_write = false;
            }
        }
        self
    }

    fn resolved_endpoint(&self) -> String {
        match &self.universe_domain {
            Some(domain) if self.endpoint == SPANNER => format!("spanner.{domain}:443"),
            _ => self.endpoint.clone(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        let max_sessions = self.channel_config.num_channels * SESSIONS_PER_CHANNEL;
        if self.session_config.max_opened > max_sessions {
            return Err(Error::InvalidConfig(format!(
                "max session size is {max_sessions} because max session size is {SESSIONS_PER_CHANNEL} per gRPC connection",
            )));
        }
        self.session_config.validate().map_err(Error::InvalidConfig)
    }
}

/// Identity of a database: `projects/{project}/instances/{instance}/databases/{database}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseId {
    pub project: String,
    pub instance: String,
    pub database: String,
}

impl DatabaseId {
    pub fn new(project: impl Into<String>, instance: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            instance: instance.into(),
            database: database.into(),
        }
    }
}

impl Display for DatabaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "projects/{}/instances/{}/databases/{}",
            self.project, self.instance, self.database
        )
    }
}

impl FromStr for DatabaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidConfig(format!("invalid database name {s}"));
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "instances", instance, "databases", database]
                if !project.is_empty() && !instance.is_empty() && !database.is_empty() =>
            {
                Ok(DatabaseId::new(*project, *instance, *database))
            }
            _ => Err(invalid()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    GRPC(#[from] Status),

    #[error(transparent)]
    InvalidSession(#[from] SessionError),

    #[error(transparent)]
    ParseError(#[from] crate::row::Error),

    #[error(transparent)]
    Connection(#[from] conn_pool::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The commit may or may not have been applied.
    #[error("commit outcome unknown: {0}")]
    CommitOutcomeUnknown(Status),

    #[error("transaction cancelled")]
    Cancelled,
}

impl TryAs<Status> for Error {
    fn try_as(&self) -> Option<&Status> {
        match self {
            Error::GRPC(s) => Some(s),
            Error::InvalidSession(e) => e.try_as(),
            _ => None,
        }
    }
}

/// Client is a client for reading and writing data to a Cloud Spanner database.
/// A client is safe to use concurrently, except for its Close method.
#[derive(Clone)]
pub struct Client {
    sessions: Arc<SessionManager>,
    defaults: TransactionDefaults,
    max_commit_delay: Option<Duration>,
}

impl Client {
    /// new creates a client to a database. A valid database name has the
    /// form projects/PROJECT_ID/instances/INSTANCE_ID/databases/DATABASE_ID.
    pub async fn new(
        database: impl Into<String>,
        config: ClientConfig,
        connector: &dyn Connector,
    ) -> Result<Self, Error> {
        let database = database.into();
        let database_id = DatabaseId::from_str(&database)?;
        config.validate()?;

        let endpoint = config.resolved_endpoint();
        let conn_pool = ConnectionManager::new(
            config.channel_config.num_channels,
            &endpoint,
            &database,
            connector,
            config.route_to_leader_enabled,
            config.default_timeout,
        )
        .await?;
        let sessions = SessionManager::new(database_id.to_string(), conn_pool, config.session_config).await?;
        tracing::debug!("spanner client created database={database_id}, endpoint={endpoint}");

        Ok(Client {
            sessions,
            defaults: TransactionDefaults {
                query_options: config.query_options,
                directed_read_options: config.directed_read_options,
            },
            max_commit_delay: config.max_commit_delay,
        })
    }

    /// Close closes all the sessions gracefully.
    /// This method can be called only once.
    pub async fn close(self) {
        self.sessions.close().await;
    }

    pub fn session_pool_stats(&self) -> PoolStats {
        self.sessions.stats()
    }

    /// single provides a read-only snapshot transaction optimized for the case
    /// where only a single read or query is needed.  This is more efficient than
    /// using read_only_transaction for a single read or query.
    pub async fn single(&self) -> Result<ReadOnlyTransaction, Error> {
        self.single_with_timestamp_bound(TimestampBound::strong_read()).await
    }

    /// single_with_timestamp_bound accepts every bound including the bounded staleness ones.
    pub async fn single_with_timestamp_bound(&self, tb: TimestampBound) -> Result<ReadOnlyTransaction, Error> {
        let session = self.sessions.get_for_read().await?;
        Ok(ReadOnlyTransaction::single(session, tb, &self.defaults))
    }

    /// read_only_transaction returns a ReadOnlyTransaction that can be used for
    /// multiple reads from the database.
    pub async fn read_only_transaction(&self) -> Result<ReadOnlyTransaction, Error> {
        self.read_only_transaction_with_option(ReadOnlyTransactionOption::default())
            .await
    }

    /// read_only_transaction_with_option returns a ReadOnlyTransaction. The snapshot begins
    /// with its first read unless `explicit_begin` is set.
    pub async fn read_only_transaction_with_option(
        &self,
        options: ReadOnlyTransactionOption,
    ) -> Result<ReadOnlyTransaction, Error> {
        let session = self.sessions.get_for_read().await?;
        let tx = if options.explicit_begin {
            ReadOnlyTransaction::begin(session, options.timestamp_bound, options.call_options, &self.defaults).await?
        } else {
            ReadOnlyTransaction::inline(session, options.timestamp_bound, &self.defaults)?
        };
        Ok(tx)
    }

    /// batch_read_only_transaction returns a BatchReadOnlyTransaction that can be used
    /// for partitioned reads or queries from a snapshot of the database. This is
    /// useful in batch processing pipelines where one wants to divide the work of
    /// reading from the database across multiple machines.
    pub async fn batch_read_only_transaction(&self) -> Result<BatchReadOnlyTransaction, Error> {
        self.batch_read_only_transaction_with_option(ReadOnlyTransactionOption::default())
            .await
    }

    pub async fn batch_read_only_transaction_with_option(
        &self,
        options: ReadOnlyTransactionOption,
    ) -> Result<BatchReadOnlyTransaction, Error> {
        let session = self.sessions.get_for_read().await?;
        let tx =
            BatchReadOnlyTransaction::begin(session, options.timestamp_bound, options.call_options, &self.defaults)
                .await?;
        Ok(tx)
    }

    /// partitioned_update executes a DML statement in parallel across the database,
    /// using separate, internal transactions that commit independently. The DML
    /// statement must be fully partitionable: it must be expressible as the union
    /// of many statements each of which accesses only a single row of the table. The
    /// statement should also be idempotent, because it may be applied more than once.
    ///
    /// PartitionedUpdate returns an estimated count of the number of rows affected.
    /// The actual number of affected rows may be greater than the estimate.
    pub async fn partitioned_update(&self, stmt: Statement) -> Result<i64, Error> {
        self.partitioned_update_with_option(stmt, PartitionedUpdateOption::default())
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn partitioned_update_with_option(
        &self,
        stmt: Statement,
        options: PartitionedUpdateOption,
    ) -> Result<i64, Error> {
        let qo = options.query_options.unwrap_or_default();
        let bo = &options.begin_options;
        let (qo, stmt) = (&qo, &stmt);
        let exclude = options.exclude_txn_from_change_streams;
        let cancel = bo.cancel.clone();
        invoke(cancel, Some(options.transaction_retry_setting), || async move {
            let session = self.sessions.get_for_read().await?;
            let tx = ReadWriteTransaction::begin_partitioned_dml(session, bo.clone(), exclude, &self.defaults).await?;
            let count = tx.update_with_option(stmt.clone(), qo.clone()).await?;
            Ok::<i64, Error>(count)
        })
        .await
    }

    /// apply_at_least_once may attempt to apply mutations more than once; if
    /// the mutations are not idempotent, this may lead to a failure being reported
    /// when the mutation was applied more than once. For example, an insert may
    /// fail with ALREADY_EXISTS even though the row did not exist before Apply was
    /// called. For this reason, most users of the library will prefer not to use
    /// this option.  However, apply_at_least_once requires only a single RPC, whereas
    /// apply's default replay protection may require an additional RPC.  So this
    /// option may be appropriate for latency sensitive and/or high throughput blind
    /// writing.
    pub async fn apply_at_least_once(&self, ms: Vec<Mutation>) -> Result<CommitResult, Error> {
        self.apply_at_least_once_with_option(ms, ApplyOptions::default())
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn apply_at_least_once_with_option(
        &self,
        ms: Vec<Mutation>,
        options: ApplyOptions,
    ) -> Result<CommitResult, Error> {
        let co = self.commit_options(options.commit_options);
        let (ms, co, to) = (&ms, &co, &options.transaction_options);
        let cancel = co.call_options.cancel.clone();
        invoke(cancel, Some(options.transaction_retry_setting), || async move {
            let session = self.sessions.get_for_write().await?;
            let result = commit_mutations(&session, ms.clone(), to, co.clone()).await;
            result.map_err(crate::transaction_rw::commit_error)
        })
        .await
    }

    /// Apply applies a list of mutations atomically to the database.
    pub async fn apply(&self, ms: Vec<Mutation>) -> Result<CommitResult, Error> {
        self.apply_with_option(ms, ReadWriteTransactionOption::default())
            .await
    }

    pub async fn apply_with_option(
        &self,
        ms: Vec<Mutation>,
        options: ReadWriteTransactionOption,
    ) -> Result<CommitResult, Error> {
        let result: Result<(CommitResult, ()), Error> = self
            .read_write_transaction_with_option(
                |tx| {
                    let ms = ms.clone();
                    Box::pin(async move {
                        tx.buffer_write(ms);
                        Ok(())
                    })
                },
                options,
            )
            .await;
        Ok(result?.0)
    }

    /// batch_write applies the mutation groups independently. The groups are not applied
    /// atomically with each other and a group may be applied more than once when the
    /// request is replayed.
    pub async fn batch_write(&self, groups: Vec<MutationGroup>) -> Result<BatchWriteStream, Error> {
        self.batch_write_with_option(groups, BatchWriteOptions::default())
            .await
    }

    pub async fn batch_write_with_option(
        &self,
        groups: Vec<MutationGroup>,
        options: BatchWriteOptions,
    ) -> Result<BatchWriteStream, Error> {
        let session = self.sessions.get_for_write().await?;
        Ok(batch_write(session, groups, options).await?)
    }

    /// begin_read_write_transaction creates a new ReadWriteTransaction with BeginTransaction.
    /// The caller commits or rolls it back with `end`. Nothing retries an abort.
    pub async fn begin_read_write_transaction(&self) -> Result<ReadWriteTransaction, Error> {
        self.begin_read_write_transaction_with_option(ReadWriteTransactionOption::default())
            .await
    }

    pub async fn begin_read_write_transaction_with_option(
        &self,
        options: ReadWriteTransactionOption,
    ) -> Result<ReadWriteTransaction, Error> {
        let session = self.sessions.get_for_write().await?;
        let tx = ReadWriteTransaction::begin(session, &options.transaction_options, options.begin_options, &self.defaults)
            .await?;
        Ok(tx)
    }

    /// ReadWriteTransaction executes a read-write transaction, with retries as
    /// necessary.
    ///
    /// The function f will be called one or more times. It must not maintain
    /// any state between calls.
    ///
    /// If the transaction cannot be committed or if f returns an ABORTED error,
    /// ReadWriteTransaction will call f again. It will continue to call f until the
    /// transaction can be committed or the retry budget is exhausted. An aborted
    /// attempt is retried on the same session after the delay requested by the server.
    ///
    /// If f returns an error other than ABORTED, the transaction is rolled back
    /// and the error is returned.
    pub async fn read_write_transaction<T, E, F>(&self, f: F) -> Result<(CommitResult, T), E>
    where
        E: TryAs<Status> + From<Error>,
        F: for<'tx> Fn(&'tx mut ReadWriteTransaction) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'tx>>,
    {
        self.read_write_transaction_with_option(f, ReadWriteTransactionOption::default())
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn read_write_transaction_with_option<T, E, F>(
        &self,
        f: F,
        options: ReadWriteTransactionOption,
    ) -> Result<(CommitResult, T), E>
    where
        E: TryAs<Status> + From<Error>,
        F: for<'tx> Fn(&'tx mut ReadWriteTransaction) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'tx>>,
    {
        let retry = options.transaction_retry_setting;
        let mut strategy = Retry::<E, TransactionPredicate<E>>::strategy(&retry);
        let deadline = Retry::<E, TransactionPredicate<E>>::total_timeout(&retry).map(|t| Instant::now() + t);
        let commit_options = self.commit_options(options.commit_options);
        let cancel = options.cancel;

        let mut session: Option<ManagedSession> = None;
        let mut previous_transaction_id: Option<Vec<u8>> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(Error::Cancelled.into());
            }
            let s = match session.take() {
                Some(s) => s,
                None => self.sessions.get_for_write().await.map_err(Error::from)?,
            };
            let mut tx = match previous_transaction_id.take() {
                Some(id) => {
                    ReadWriteTransaction::retry_of(s, &options.transaction_options, Some(id), &self.defaults)
                }
                None => ReadWriteTransaction::new(s, &options.transaction_options, &self.defaults),
            };

            let result = match &cancel {
                Some(cancel) => {
                    let run = f(&mut tx);
                    select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        v = run => Some(v),
                    }
                }
                None => Some(f(&mut tx).await),
            };
            let result = match result {
                Some(result) => result,
                None => {
                    tracing::debug!("read-write transaction cancelled session={}", tx.session_name());
                    let _ = tx.rollback(None).await;
                    return Err(Error::Cancelled.into());
                }
            };

            let err = match tx.end(result, Some(commit_options.clone())).await {
                Ok(v) => return Ok(v),
                Err(err) => err,
            };
            if !Retry::<E, TransactionPredicate<E>>::predicate(&retry).should_retry(&err) {
                return Err(err);
            }
            let backoff = match strategy.next() {
                Some(d) => d,
                None => return Err(err),
            };
            let delay = Retry::<E, TransactionPredicate<E>>::delay(&retry, &err, backoff);
            if deadline.is_some_and(|d| Instant::now() + delay > d) {
                return Err(err);
            }

            // a lost session is replaced, any other retry keeps the session and its lock priority
            let lost = err.try_as().is_some_and(is_session_not_found);
            if lost {
                tracing::debug!("session not found, retry on a new session attempt={attempt}");
                tx.take_session().discard();
            } else {
                if tx.session.is_multiplexed() {
                    previous_transaction_id = tx.context.transaction_id().map(|id| id.to_vec());
                }
                session = Some(tx.take_session());
            }
            tracing::debug!("retry read-write transaction after {}ms attempt={attempt}", delay.as_millis());

            match &cancel {
                Some(cancel) => {
                    select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn commit_options(&self, mut options: CommitOptions) -> CommitOptions {
        if options.max_commit_delay.is_none() {
            options.max_commit_delay = self.max_commit_delay;
        }
        options
    }
}
