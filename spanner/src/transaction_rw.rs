use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tonic::{Code, Status};

use crate::apiv1::types::commit_request::Transaction::TransactionId;
use crate::apiv1::types::transaction_options::{IsolationLevel, Mode, PartitionedDml, ReadWrite};
use crate::apiv1::types::{
    commit_request, execute_batch_dml_request, BeginTransactionRequest, CommitRequest, CommitResponse,
    ExecuteBatchDmlRequest, ExecuteSqlRequest, Mutation, ResultSet, RollbackRequest, Transaction as TransactionMessage,
    TransactionOptions,
};
use crate::client::Error;
use crate::mutation::select_mutation_key;
use crate::retry::{invoke, RetrySetting, TransactionRetrySetting, TryAs};
use crate::session::{ManagedSession, SessionHandle};
use crate::statement::Statement;
use crate::transaction::{
    merge_query_options, row_count, with_cancel, CallOptions, QueryOptions, Transaction, TransactionContext,
    TransactionDefaults, TransactionMode,
};
use crate::value::{to_proto_duration, Timestamp};

/// First delay of the retry loop around a stand-alone BeginTransaction.
const BEGIN_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(4);

#[derive(Clone, Default)]
pub struct CommitOptions {
    pub return_commit_stats: bool,
    /// How long the server may delay the commit to batch it with others.
    pub max_commit_delay: Option<Duration>,
    pub call_options: CallOptions,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitResult {
    pub timestamp: Option<Timestamp>,
    /// Number of mutations applied. Only returned when commit stats were requested.
    pub mutation_count: Option<i64>,
}

impl From<CommitResponse> for CommitResult {
    fn from(value: CommitResponse) -> Self {
        Self {
            timestamp: value.commit_timestamp.map(|v| v.into()),
            mutation_count: value.commit_stats.map(|s| s.mutation_count),
        }
    }
}

/// Options of a read-write transaction.
#[derive(Clone, Default)]
pub struct ReadWriteOptions {
    pub isolation_level: IsolationLevel,
    pub exclude_txn_from_change_streams: bool,
    pub transaction_tag: String,
}

impl ReadWriteOptions {
    pub(crate) fn transaction_options(&self, previous_transaction_id: Option<Vec<u8>>) -> TransactionOptions {
        TransactionOptions {
            mode: Some(Mode::ReadWrite(ReadWrite {
                multiplexed_session_previous_transaction_id: previous_transaction_id.unwrap_or_default(),
            })),
            exclude_txn_from_change_streams: self.exclude_txn_from_change_streams,
            isolation_level: self.isolation_level,
        }
    }
}

/// ReadWriteTransaction provides a locking read-write transaction.
///
/// This type of transaction is the only way to write data into Cloud Spanner;
/// Client::apply, Client::apply_at_least_once, Client::partitioned_update use
/// transactions internally. These transactions rely on pessimistic locking and,
/// if necessary, two-phase commit. Locking read-write transactions may abort,
/// requiring the application to retry. However, the interface exposed by
/// Client::read_write_transaction eliminates the need for applications to write
/// retry loops explicitly.
///
/// Locking transactions may be used to atomically read-modify-write data
/// anywhere in a database. This type of transaction is externally consistent.
///
/// Clients should attempt to minimize the amount of time a transaction is
/// active. Faster transactions commit with higher probability and cause less
/// contention. Cloud Spanner attempts to keep read locks active as long as the
/// transaction continues to do reads.  Long periods of inactivity at the client
/// may cause Cloud Spanner to release a transaction's locks and abort it.
///
/// Reads performed within a transaction acquire locks on the data being
/// read. Writes can only be done at commit time, after all reads have been
/// completed. Conceptually, a read-write transaction consists of zero or more
/// reads or SQL queries followed by a commit.
///
/// Semantics
///
/// Cloud Spanner can commit the transaction if all read locks it acquired are
/// still valid at commit time, and it is able to acquire write locks for all
/// writes. Cloud Spanner can abort the transaction for any reason. If a commit
/// attempt returns ABORTED, Cloud Spanner guarantees that the transaction has
/// not modified any user data in Cloud Spanner.
///
/// Unless the transaction commits, Cloud Spanner makes no guarantees about how
/// long the transaction's locks were held for. It is an error to use Cloud
/// Spanner locks for any sort of mutual exclusion other than between Cloud
/// Spanner transactions themselves.
///
/// Aborted transactions
///
/// Application code does not need to retry explicitly; Client::read_write_transaction
/// will automatically retry a transaction if an attempt results in an abort. The lock
/// priority of a transaction increases after each prior aborted transaction,
/// meaning that the next attempt has a slightly better chance of success than
/// before.
pub struct ReadWriteTransaction {
    base_tx: Transaction,
    wb: Vec<Mutation>,
}

impl Deref for ReadWriteTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.base_tx
    }
}

impl DerefMut for ReadWriteTransaction {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.base_tx
    }
}

/// Begins a transaction with BeginTransaction. Aborted and cut streams are retried with
/// the server supplied delay or an exponential backoff.
pub(crate) async fn begin_with_retry(
    session: &SessionHandle,
    request: BeginTransactionRequest,
    options: &CallOptions,
) -> Result<TransactionMessage, Status> {
    let setting = TransactionRetrySetting::begin(BEGIN_RETRY_INITIAL_DELAY);
    let request = &request;
    let retry = &options.retry;
    invoke(options.cancel.clone(), Some(setting), || async move {
        let result = session
            .spanner_client
            .begin_transaction(request.clone(), true, retry.clone())
            .await;
        session.invalidate_if_needed(result).await.map(|r| r.into_inner())
    })
    .await
}

impl ReadWriteTransaction {
    /// A transaction that begins with its first statement. A transaction prepared by the
    /// pool is used instead when its options match.
    pub(crate) fn new(session: ManagedSession, options: &ReadWriteOptions, defaults: &TransactionDefaults) -> Self {
        let tx_options = options.transaction_options(None);
        let prepared = if tx_options == ReadWriteOptions::default().transaction_options(None) {
            session.take_prepared_transaction()
        } else {
            None
        };
        let context = match prepared {
            Some(id) => {
                tracing::trace!("use prepared transaction session={}", session.name());
                let tx = TransactionMessage {
                    id,
                    ..Default::default()
                };
                TransactionContext::begun(TransactionMode::ReadWrite, tx_options, &tx)
                    .with_tag(options.transaction_tag.clone())
            }
            None => TransactionContext::new(TransactionMode::ReadWrite, tx_options, options.transaction_tag.clone()),
        };
        Self::with_context(session, context, defaults)
    }

    /// Retry of an aborted transaction on a multiplexed session. The previous id lets the
    /// server keep the lock priority of the aborted attempt.
    pub(crate) fn retry_of(
        session: ManagedSession,
        options: &ReadWriteOptions,
        previous_transaction_id: Option<Vec<u8>>,
        defaults: &TransactionDefaults,
    ) -> Self {
        if !session.is_multiplexed() || previous_transaction_id.is_none() {
            return Self::new(session, options, defaults);
        }
        let context = TransactionContext::new(
            TransactionMode::ReadWrite,
            options.transaction_options(previous_transaction_id),
            options.transaction_tag.clone(),
        );
        Self::with_context(session, context, defaults)
    }

    fn with_context(session: ManagedSession, context: TransactionContext, defaults: &TransactionDefaults) -> Self {
        ReadWriteTransaction {
            base_tx: Transaction::new(session, context, defaults),
            wb: vec![],
        }
    }

    /// begin starts a read-write transaction with an explicit BeginTransaction.
    pub(crate) async fn begin(
        session: ManagedSession,
        options: &ReadWriteOptions,
        call_options: CallOptions,
        defaults: &TransactionDefaults,
    ) -> Result<ReadWriteTransaction, Status> {
        let tx_options = options.transaction_options(None);
        let request = BeginTransactionRequest {
            session: session.name().to_string(),
            options: Some(tx_options.clone()),
            request_options: None,
            mutation_key: None,
        };
        let tx = begin_with_retry(&session, request, &call_options).await?;
        let context =
            TransactionContext::begun(TransactionMode::ReadWrite, tx_options, &tx).with_tag(options.transaction_tag.clone());
        Ok(Self::with_context(session, context, defaults))
    }

    pub(crate) async fn begin_partitioned_dml(
        session: ManagedSession,
        call_options: CallOptions,
        exclude_txn_from_change_streams: bool,
        defaults: &TransactionDefaults,
    ) -> Result<ReadWriteTransaction, Status> {
        let tx_options = TransactionOptions {
            mode: Some(Mode::PartitionedDml(PartitionedDml {})),
            exclude_txn_from_change_streams,
            ..Default::default()
        };
        let request = BeginTransactionRequest {
            session: session.name().to_string(),
            options: Some(tx_options.clone()),
            request_options: None,
            mutation_key: None,
        };
        let tx = begin_with_retry(&session, request, &call_options).await?;
        let context = TransactionContext::begun(TransactionMode::PartitionedDml, tx_options, &tx);
        Ok(Self::with_context(session, context, defaults))
    }

    /// buffer_write buffers the mutations. They are sent with the commit.
    pub fn buffer_write(&mut self, ms: Vec<Mutation>) {
        self.wb.extend(ms)
    }

    pub fn buffered_mutations(&self) -> &[Mutation] {
        &self.wb
    }

    /// update executes a DML statement and returns the number of affected rows.
    pub async fn update(&self, stmt: Statement) -> Result<i64, Status> {
        self.update_with_option(stmt, QueryOptions::default()).await
    }

    pub async fn update_with_option(&self, stmt: Statement, options: QueryOptions) -> Result<i64, Status> {
        let result_set = self.update_resultset(stmt, options).await?;
        row_count(result_set.stats.as_ref())
    }

    /// update_resultset executes a DML statement and returns the whole result set, which
    /// contains the returned rows of a `THEN RETURN` clause.
    pub async fn update_resultset(&self, stmt: Statement, options: QueryOptions) -> Result<ResultSet, Status> {
        if options.directed_read_options.is_some() {
            return Err(Status::invalid_argument(
                "directed read options can only be used in read-only transactions",
            ));
        }
        let (selector, begin_guard) = self.context.selector().await;
        let params = stmt.params_struct();
        let request = ExecuteSqlRequest {
            session: self.session_name().to_string(),
            transaction: Some(selector),
            sql: stmt.sql,
            params,
            param_types: stmt.param_types,
            resume_token: vec![],
            query_mode: options.mode,
            partition_token: vec![],
            seqno: self.context.next_seqno(),
            query_options: merge_query_options(options.optimizer_options, self.default_query_options.as_ref()),
            request_options: self.create_request_options(options.request_options),
            directed_read_options: None,
            data_boost_enabled: false,
            last_statement: options.last_statement,
        };

        let session = &self.session;
        let cancel = options.call_options.cancel.as_ref();
        let result = with_cancel(
            cancel,
            session.spanner_client.execute_sql(request, true, options.call_options.retry),
        )
        .await;
        let response = session.invalidate_if_needed(result).await?.into_inner();
        if let Some(tx) = response.metadata.as_ref().and_then(|m| m.transaction.as_ref()) {
            self.context.set_transaction(tx);
        }
        self.context.update_precommit_token(response.precommit_token.clone());
        drop(begin_guard);
        Ok(response)
    }

    /// batch_update executes the DML statements in order and returns the number of rows
    /// affected by each of them. The execution stops at the first failed statement; its
    /// status is returned as the error.
    pub async fn batch_update(&self, stmt: Vec<Statement>) -> Result<Vec<i64>, Status> {
        self.batch_update_with_option(stmt, QueryOptions::default()).await
    }

    pub async fn batch_update_with_option(
        &self,
        stmt: Vec<Statement>,
        options: QueryOptions,
    ) -> Result<Vec<i64>, Status> {
        let (selector, begin_guard) = self.context.selector().await;
        let request = ExecuteBatchDmlRequest {
            session: self.session_name().to_string(),
            transaction: Some(selector),
            seqno: self.context.next_seqno(),
            request_options: self.create_request_options(options.request_options),
            statements: stmt
                .into_iter()
                .map(|x| {
                    let params = x.params_struct();
                    execute_batch_dml_request::Statement {
                        sql: x.sql,
                        params,
                        param_types: x.param_types,
                    }
                })
                .collect(),
            last_statements: options.last_statement,
        };

        let session = &self.session;
        let cancel = options.call_options.cancel.as_ref();
        let result = with_cancel(
            cancel,
            session.spanner_client.execute_batch_dml(request, options.call_options.retry),
        )
        .await;
        let response = session.invalidate_if_needed(result).await?.into_inner();
        if let Some(tx) = response
            .result_sets
            .first()
            .and_then(|rs| rs.metadata.as_ref())
            .and_then(|m| m.transaction.as_ref())
        {
            self.context.set_transaction(tx);
        }
        self.context.update_precommit_token(response.precommit_token.clone());
        drop(begin_guard);

        let row_counts = response
            .result_sets
            .iter()
            .map(|x| row_count(x.stats.as_ref()))
            .collect::<Result<Vec<i64>, Status>>()?;
        match response.status {
            Some(status) if status.code != Code::Ok as i32 => Err(Status::new(
                Code::from_i32(status.code),
                format!(
                    "{} (statement index={}, succeeded statements={:?})",
                    status.message,
                    row_counts.len(),
                    row_counts
                ),
            )),
            _ => Ok(row_counts),
        }
    }

    /// end commits the transaction when the result is Ok and rolls it back otherwise.
    pub async fn end<S, E>(&mut self, result: Result<S, E>, options: Option<CommitOptions>) -> Result<(CommitResult, S), E>
    where
        E: TryAs<Status> + From<Error>,
    {
        let opt = options.unwrap_or_default();
        match result {
            Ok(success) => {
                let cr = self.commit(opt).await.map_err(|e| E::from(commit_error(e)))?;
                Ok((cr, success))
            }
            Err(err) => {
                if let Some(status) = err.try_as() {
                    // can't rollback. should retry
                    if status.code() == Code::Aborted {
                        return Err(err);
                    }
                }
                let _ = self.rollback(opt.call_options.retry).await;
                Err(err)
            }
        }
    }

    /// Begins the transaction when no statement did. Multiplexed sessions need a mutation
    /// key to begin a transaction that only writes.
    async fn begin_explicitly(&self, options: &CallOptions) -> Result<Vec<u8>, Status> {
        let mutation_key = if self.session.is_multiplexed() {
            select_mutation_key(&self.wb)
        } else {
            None
        };
        let request = BeginTransactionRequest {
            session: self.session_name().to_string(),
            options: Some(self.context.options().clone()),
            request_options: self.create_request_options(None),
            mutation_key,
        };
        tracing::debug!("begin transaction explicitly before commit session={}", self.session_name());
        let tx = begin_with_retry(&self.session, request, options).await?;
        self.context.set_transaction(&tx);
        self.context
            .transaction_id()
            .map(|id| id.to_vec())
            .ok_or_else(|| Status::internal("no transaction id returned"))
    }

    pub async fn commit(&mut self, options: CommitOptions) -> Result<CommitResult, Status> {
        let tx_id = match self.context.transaction_id() {
            Some(id) => id.to_vec(),
            None => self.begin_explicitly(&options.call_options).await?,
        };
        let mutations = self.wb.to_vec();
        let response = commit(&self.session, &self.context, mutations, TransactionId(tx_id), options).await?;
        Ok(response.into())
    }

    pub async fn rollback(&self, retry: Option<RetrySetting>) -> Result<(), Status> {
        let transaction_id = match self.context.transaction_id() {
            Some(id) => id.to_vec(),
            // nothing has begun on the server
            None => return Ok(()),
        };
        let request = RollbackRequest {
            transaction_id,
            session: self.session_name().to_string(),
        };
        let session = &self.session;
        let result = session.spanner_client.rollback(request, retry).await;
        session.invalidate_if_needed(result).await?.into_inner();
        Ok(())
    }

    pub(crate) fn take_session(self) -> ManagedSession {
        self.base_tx.into_session()
    }
}

/// An unknown commit outcome must not be retried: the transaction may have been applied.
pub(crate) fn commit_error(status: Status) -> Error {
    match status.code() {
        Code::Unknown => Error::CommitOutcomeUnknown(status),
        _ => Error::GRPC(status),
    }
}

pub(crate) async fn commit(
    session: &SessionHandle,
    context: &TransactionContext,
    ms: Vec<Mutation>,
    tx: commit_request::Transaction,
    commit_options: CommitOptions,
) -> Result<CommitResponse, Status> {
    let mut request = CommitRequest {
        session: session.name().to_string(),
        mutations: ms,
        transaction: Some(tx),
        request_options: context.request_options(None),
        return_commit_stats: commit_options.return_commit_stats,
        max_commit_delay: commit_options.max_commit_delay.map(to_proto_duration),
        precommit_token: context.precommit_token(),
    };
    let call_options = commit_options.call_options;
    let cancel = call_options.cancel.as_ref();
    let result = with_cancel(cancel, session.spanner_client.commit(request.clone(), call_options.retry.clone())).await;
    let mut response = session.invalidate_if_needed(result).await?.into_inner();

    // the server asks for another commit echoing a newer token
    if let Some(token) = response.precommit_token.take() {
        if response.commit_timestamp.is_none() {
            tracing::debug!("retry commit with precommit token seq_num={}", token.seq_num);
            context.update_precommit_token(Some(token));
            request.precommit_token = context.precommit_token();
            let result = with_cancel(cancel, session.spanner_client.commit(request, call_options.retry)).await;
            response = session.invalidate_if_needed(result).await?.into_inner();
        }
    }
    Ok(response)
}
