use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::apiv1::types::transaction_options::IsolationLevel;
use crate::apiv1::types::transaction_selector::Selector;
use crate::apiv1::types::{
    DirectedReadOptions, ExecuteSqlRequest, MultiplexedSessionPrecommitToken, QueryMode,
    QueryOptions as ExecuteQueryOptions, ReadRequest, RequestOptions, Transaction as TransactionMessage,
    TransactionOptions, TransactionSelector,
};
use crate::key::{Key, KeySet};
use crate::reader::{Reader, RowIterator, StatementReader, TableReader};
use crate::retry::RetrySetting;
use crate::row::Row;
use crate::session::ManagedSession;
use crate::statement::Statement;

#[derive(Clone, Default)]
pub struct CallOptions {
    /// Retry setting of the RPC that opens the stream. None uses the client default.
    pub retry: Option<RetrySetting>,
    /// Cancels the call. A cancelled read-write transaction is rolled back.
    pub cancel: Option<CancellationToken>,
}

#[derive(Clone, Default)]
pub struct ReadOptions {
    /// The index to use for reading. If non-empty, you can only read columns
    /// that are part of the index key, part of the primary key, or stored in the
    /// index due to a STORING clause in the index definition.
    pub index: String,

    /// The maximum number of rows to read. A limit value less than 1 means no limit.
    pub limit: i64,

    pub call_options: CallOptions,

    /// Priority and request tag of the read. The transaction tag is set by the transaction.
    pub request_options: Option<RequestOptions>,

    /// Replica selection. Only honored by read-only transactions.
    pub directed_read_options: Option<DirectedReadOptions>,

    pub data_boost_enabled: bool,
}

#[derive(Clone)]
pub struct QueryOptions {
    pub mode: QueryMode,
    pub optimizer_options: Option<ExecuteQueryOptions>,
    pub call_options: CallOptions,
    /// If false, a broken stream is not resumed with the resume token.
    pub enable_resume: bool,
    pub request_options: Option<RequestOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
    pub data_boost_enabled: bool,
    /// Marks the last statement of a read-write transaction.
    pub last_statement: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            mode: QueryMode::Normal,
            optimizer_options: None,
            call_options: CallOptions::default(),
            enable_resume: true,
            request_options: None,
            directed_read_options: None,
            data_boost_enabled: false,
            last_statement: false,
        }
    }
}

/// Merges optimizer options field by field. Values set on `preferred` win.
pub(crate) fn merge_query_options(
    preferred: Option<ExecuteQueryOptions>,
    fallback: Option<&ExecuteQueryOptions>,
) -> Option<ExecuteQueryOptions> {
    match (preferred, fallback) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(f)) => Some(f.clone()),
        (Some(p), Some(f)) => Some(ExecuteQueryOptions {
            optimizer_version: if p.optimizer_version.is_empty() {
                f.optimizer_version.clone()
            } else {
                p.optimizer_version
            },
            optimizer_statistics_package: if p.optimizer_statistics_package.is_empty() {
                f.optimizer_statistics_package.clone()
            } else {
                p.optimizer_statistics_package
            },
        }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    /// One read or query in a temporary read-only transaction.
    SingleUse,
    /// Snapshot shared by several reads.
    ReadOnly,
    ReadWrite,
    PartitionedDml,
    /// Commit of mutations without preceding reads.
    MutationOnly,
}

/// State shared by every operation of one transaction attempt: the transaction id, the
/// precommit token, statement counters and the lock that serializes the inline begin.
pub struct TransactionContext {
    mode: TransactionMode,
    options: TransactionOptions,
    id: OnceLock<Vec<u8>>,
    read_timestamp: Mutex<Option<OffsetDateTime>>,
    begin_lock: tokio::sync::Mutex<()>,
    precommit_token: Mutex<Option<MultiplexedSessionPrecommitToken>>,
    sequence_number: AtomicI64,
    read_attempts: AtomicI64,
    transaction_tag: String,
}

impl TransactionContext {
    pub(crate) fn new(mode: TransactionMode, options: TransactionOptions, transaction_tag: String) -> Self {
        TransactionContext {
            mode,
            options,
            id: OnceLock::new(),
            read_timestamp: Mutex::new(None),
            begin_lock: tokio::sync::Mutex::new(()),
            precommit_token: Mutex::new(None),
            sequence_number: AtomicI64::new(0),
            read_attempts: AtomicI64::new(0),
            transaction_tag,
        }
    }

    /// Context of a transaction begun with an explicit BeginTransaction.
    pub(crate) fn begun(mode: TransactionMode, options: TransactionOptions, tx: &TransactionMessage) -> Self {
        let ctx = Self::new(mode, options, String::new());
        ctx.set_transaction(tx);
        ctx
    }

    pub(crate) fn with_tag(mut self, transaction_tag: String) -> Self {
        self.transaction_tag = transaction_tag;
        self
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn transaction_id(&self) -> Option<&[u8]> {
        self.id.get().map(|v| v.as_slice())
    }

    pub fn read_timestamp(&self) -> Option<OffsetDateTime> {
        *self.read_timestamp.lock()
    }

    pub fn transaction_tag(&self) -> &str {
        &self.transaction_tag
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.options.isolation_level
    }

    pub fn precommit_token(&self) -> Option<MultiplexedSessionPrecommitToken> {
        self.precommit_token.lock().clone()
    }

    /// Number of reads and queries started in this transaction.
    pub fn read_attempts(&self) -> i64 {
        self.read_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn is_read_write(&self) -> bool {
        matches!(self.mode, TransactionMode::ReadWrite | TransactionMode::PartitionedDml)
    }

    /// Statement sequence numbers start at 1 and never repeat within a transaction.
    pub(crate) fn next_seqno(&self) -> i64 {
        self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records the transaction the server began. The first id wins.
    pub(crate) fn set_transaction(&self, tx: &TransactionMessage) {
        self.update_precommit_token(tx.precommit_token.clone());
        if let Some(ts) = &tx.read_timestamp {
            let mut read_timestamp = self.read_timestamp.lock();
            if read_timestamp.is_none() {
                *read_timestamp = to_offset_date_time(ts);
            }
        }
        // single-use reads only report the read timestamp
        if tx.id.is_empty() {
            return;
        }
        if self.id.set(tx.id.clone()).is_err() && self.id.get() != Some(&tx.id) {
            tracing::warn!("transaction id is already assigned, ignore another one");
        }
    }

    /// Keeps the token with the highest sequence number. Tokens may arrive out of order.
    pub(crate) fn update_precommit_token(&self, token: Option<MultiplexedSessionPrecommitToken>) {
        let token = match token {
            Some(t) => t,
            None => return,
        };
        let mut current = self.precommit_token.lock();
        let replace = match current.as_ref() {
            Some(c) => token.seq_num > c.seq_num,
            None => true,
        };
        if replace {
            *current = Some(token);
        }
    }

    /// Returns the selector of the next request. When the transaction has not begun yet the
    /// caller gets the begin selector together with the begin lock, and must hold the lock
    /// until the id is known or the request failed. Concurrent callers wait on the lock and
    /// then use the id.
    pub(crate) async fn selector(&self) -> (TransactionSelector, Option<MutexGuard<'_, ()>>) {
        if self.mode == TransactionMode::SingleUse {
            return (selector(Selector::SingleUse(self.options.clone())), None);
        }
        if let Some(id) = self.id.get() {
            return (selector(Selector::Id(id.clone())), None);
        }
        let guard = self.begin_lock.lock().await;
        match self.id.get() {
            Some(id) => (selector(Selector::Id(id.clone())), None),
            None => {
                tracing::trace!("begin transaction inline");
                (selector(Selector::Begin(self.options.clone())), Some(guard))
            }
        }
    }

    /// Selector to use after the id became known.
    pub(crate) fn id_selector(&self) -> Option<TransactionSelector> {
        self.id.get().map(|id| selector(Selector::Id(id.clone())))
    }

    /// Request options with the transaction tag. The tag is ignored by read-only transactions.
    pub(crate) fn request_options(&self, options: Option<RequestOptions>) -> Option<RequestOptions> {
        let tag = self.transaction_tag.as_str();
        let accepts_tag = !matches!(self.mode, TransactionMode::SingleUse | TransactionMode::ReadOnly);
        match options {
            None if tag.is_empty() || !accepts_tag => None,
            None => Some(RequestOptions {
                transaction_tag: tag.to_string(),
                ..Default::default()
            }),
            Some(mut o) => {
                o.transaction_tag = if accepts_tag { tag.to_string() } else { String::new() };
                Some(o)
            }
        }
    }

    pub(crate) fn count_read(&self) {
        self.read_attempts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs the future unless the token is cancelled first.
pub(crate) async fn with_cancel<T>(
    cancel: Option<&CancellationToken>,
    f: impl std::future::Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => Err(Status::cancelled("client cancel")),
            v = f => v,
        },
        None => f.await,
    }
}

fn selector(s: Selector) -> TransactionSelector {
    TransactionSelector { selector: Some(s) }
}

pub(crate) fn to_offset_date_time(ts: &prost_types::Timestamp) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ts.seconds as i128 * 1_000_000_000 + ts.nanos as i128).ok()
}

/// Client wide defaults applied to every request of a transaction.
#[derive(Clone, Default)]
pub(crate) struct TransactionDefaults {
    pub query_options: Option<ExecuteQueryOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
}

/// Base of all transactions: reads and queries on one session within one transaction context.
pub struct Transaction {
    pub(crate) session: ManagedSession,
    pub(crate) context: TransactionContext,
    pub(crate) route_to_leader: bool,
    pub(crate) default_query_options: Option<ExecuteQueryOptions>,
    pub(crate) default_directed_read_options: Option<DirectedReadOptions>,
}

impl Transaction {
    pub(crate) fn new(session: ManagedSession, context: TransactionContext, defaults: &TransactionDefaults) -> Self {
        let route_to_leader = context.is_read_write();
        Transaction {
            session,
            context,
            route_to_leader,
            default_query_options: defaults.query_options.clone(),
            default_directed_read_options: defaults.directed_read_options.clone(),
        }
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    pub(crate) fn into_session(self) -> ManagedSession {
        self.session
    }

    pub(crate) fn create_request_options(&self, options: Option<RequestOptions>) -> Option<RequestOptions> {
        self.context.request_options(options)
    }

    fn directed_read_options(&self, options: Option<DirectedReadOptions>) -> Result<Option<DirectedReadOptions>, Status> {
        if self.context.is_read_write() {
            if options.is_some() {
                return Err(Status::invalid_argument(
                    "directed read options can only be used in read-only transactions",
                ));
            }
            return Ok(None);
        }
        Ok(options.or_else(|| self.default_directed_read_options.clone()))
    }

    fn seqno(&self) -> i64 {
        match self.context.mode() {
            TransactionMode::SingleUse => 0,
            _ => self.context.next_seqno(),
        }
    }

    /// query executes a query against the database. It returns a RowIterator for
    /// retrieving the resulting rows.
    pub async fn query(&self, statement: Statement) -> Result<RowIterator<'_, StatementReader>, Status> {
        self.query_with_option(statement, QueryOptions::default()).await
    }

    /// query_with_option executes a query with the given options.
    pub async fn query_with_option(
        &self,
        statement: Statement,
        options: QueryOptions,
    ) -> Result<RowIterator<'_, StatementReader>, Status> {
        let directed_read_options = self.directed_read_options(options.directed_read_options)?;
        let (selector, begin_guard) = self.context.selector().await;
        let params = statement.params_struct();
        let request = ExecuteSqlRequest {
            session: self.session.name().to_string(),
            transaction: Some(selector),
            sql: statement.sql,
            params,
            param_types: statement.param_types,
            resume_token: vec![],
            query_mode: options.mode,
            partition_token: vec![],
            seqno: self.seqno(),
            query_options: merge_query_options(options.optimizer_options, self.default_query_options.as_ref()),
            request_options: self.create_request_options(options.request_options),
            directed_read_options,
            data_boost_enabled: options.data_boost_enabled,
            last_statement: options.last_statement,
        };
        self.context.count_read();
        let reader = StatementReader {
            enable_resume: options.enable_resume,
            request,
        };
        RowIterator::new(
            &self.session,
            reader,
            Some(options.call_options),
            self.route_to_leader,
            Some(&self.context),
            begin_guard,
        )
        .await
    }

    /// read returns a RowIterator for reading multiple rows from the database.
    pub async fn read(
        &self,
        table: &str,
        columns: &[&str],
        key_set: impl Into<KeySet>,
    ) -> Result<RowIterator<'_, TableReader>, Status> {
        self.read_with_option(table, columns, key_set, ReadOptions::default()).await
    }

    /// read_with_option returns a RowIterator for reading multiple rows from the database.
    pub async fn read_with_option(
        &self,
        table: &str,
        columns: &[&str],
        key_set: impl Into<KeySet>,
        options: ReadOptions,
    ) -> Result<RowIterator<'_, TableReader>, Status> {
        let directed_read_options = self.directed_read_options(options.directed_read_options)?;
        let (selector, begin_guard) = self.context.selector().await;
        let request = ReadRequest {
            session: self.session.name().to_string(),
            transaction: Some(selector),
            table: table.to_string(),
            index: options.index,
            columns: columns.iter().map(|x| x.to_string()).collect(),
            key_set: Some(key_set.into().inner),
            limit: options.limit,
            resume_token: vec![],
            partition_token: vec![],
            request_options: self.create_request_options(options.request_options),
            directed_read_options,
            data_boost_enabled: options.data_boost_enabled,
        };
        self.context.count_read();
        RowIterator::new(
            &self.session,
            TableReader { request },
            Some(options.call_options),
            self.route_to_leader,
            Some(&self.context),
            begin_guard,
        )
        .await
    }

    /// read_row reads a single row from the database.
    pub async fn read_row(&self, table: &str, columns: &[&str], key: Key) -> Result<Option<Row>, Status> {
        self.read_row_with_option(table, columns, key, ReadOptions::default()).await
    }

    /// read_row_with_option reads a single row from the database.
    pub async fn read_row_with_option(
        &self,
        table: &str,
        columns: &[&str],
        key: Key,
        options: ReadOptions,
    ) -> Result<Option<Row>, Status> {
        let mut reader = self.read_with_option(table, columns, key, options).await?;
        reader.next().await
    }
}

/// Reads the affected row count of a DML result.
pub(crate) fn row_count(stats: Option<&crate::apiv1::types::ResultSetStats>) -> Result<i64, Status> {
    use crate::apiv1::types::RowCount;
    match stats.and_then(|s| s.row_count) {
        Some(RowCount::Exact(v)) => Ok(v),
        Some(RowCount::LowerBound(v)) => Ok(v),
        None => Err(Status::internal("no row count found")),
    }
}
