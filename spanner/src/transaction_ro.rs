use std::ops::{Deref, DerefMut};

use time::OffsetDateTime;
use tonic::Status;

use crate::apiv1::types::transaction_options::Mode;
use crate::apiv1::types::{
    BeginTransactionRequest, ExecuteSqlRequest, PartitionOptions, PartitionQueryRequest, PartitionReadRequest,
    ReadRequest, TransactionOptions,
};
use crate::key::KeySet;
use crate::reader::{Reader, RowIterator, StatementReader, TableReader};
use crate::session::ManagedSession;
use crate::statement::Statement;
use crate::transaction::{
    merge_query_options, CallOptions, QueryOptions, ReadOptions, Transaction, TransactionContext, TransactionDefaults,
    TransactionMode,
};
use crate::value::TimestampBound;

fn read_only_options(tb: TimestampBound) -> TransactionOptions {
    TransactionOptions {
        mode: Some(Mode::ReadOnly(tb.into())),
        ..Default::default()
    }
}

/// ReadOnlyTransaction provides a snapshot transaction with guaranteed
/// consistency across reads, but does not allow writes.  Read-only transactions
/// can be configured to read at timestamps in the past.
///
/// Read-only transactions do not take locks. Instead, they work by choosing a
/// Cloud Spanner timestamp, then executing all reads at that timestamp. Since
/// they do not acquire locks, they do not block concurrent read-write
/// transactions.
///
/// Unlike locking read-write transactions, read-only transactions never abort.
/// They can fail if the chosen read timestamp is garbage collected; however, the
/// default garbage collection policy is generous enough that most applications
/// do not need to worry about this in practice. See the documentation of
/// TimestampBound for more details.
pub struct ReadOnlyTransaction {
    base_tx: Transaction,
}

impl Deref for ReadOnlyTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Self::Target {
        &self.base_tx
    }
}

impl DerefMut for ReadOnlyTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base_tx
    }
}

impl ReadOnlyTransaction {
    /// A single read or query at the given bound. Bounded staleness is allowed here only.
    pub(crate) fn single(session: ManagedSession, tb: TimestampBound, defaults: &TransactionDefaults) -> Self {
        let context = TransactionContext::new(TransactionMode::SingleUse, read_only_options(tb), String::new());
        ReadOnlyTransaction {
            base_tx: Transaction::new(session, context, defaults),
        }
    }

    /// A multi-use snapshot. The first read begins the transaction inline and the
    /// following ones reuse its id.
    pub(crate) fn inline(
        session: ManagedSession,
        tb: TimestampBound,
        defaults: &TransactionDefaults,
    ) -> Result<Self, Status> {
        if tb.is_bounded_staleness() {
            return Err(Status::invalid_argument(
                "bounded staleness can only be used with single-use read-only transactions",
            ));
        }
        let context = TransactionContext::new(TransactionMode::ReadOnly, read_only_options(tb), String::new());
        Ok(ReadOnlyTransaction {
            base_tx: Transaction::new(session, context, defaults),
        })
    }

    /// begin starts a snapshot read-only Transaction on Cloud Spanner.
    pub(crate) async fn begin(
        session: ManagedSession,
        tb: TimestampBound,
        options: CallOptions,
        defaults: &TransactionDefaults,
    ) -> Result<ReadOnlyTransaction, Status> {
        if tb.is_bounded_staleness() {
            return Err(Status::invalid_argument(
                "bounded staleness can only be used with single-use read-only transactions",
            ));
        }
        let tx_options = read_only_options(tb);
        let request = BeginTransactionRequest {
            session: session.name().to_string(),
            options: Some(tx_options.clone()),
            request_options: None,
            mutation_key: None,
        };
        let result = session.spanner_client.begin_transaction(request, false, options.retry).await;
        let tx = session.invalidate_if_needed(result).await?.into_inner();
        tracing::trace!("read-only transaction begun session={}", session.name());
        let context = TransactionContext::begun(TransactionMode::ReadOnly, tx_options, &tx);
        Ok(ReadOnlyTransaction {
            base_tx: Transaction::new(session, context, defaults),
        })
    }

    /// The snapshot timestamp. Known once the first read returned its metadata.
    pub fn read_timestamp(&self) -> Option<OffsetDateTime> {
        self.context.read_timestamp()
    }
}

pub struct Partition<T: Reader> {
    pub reader: T,
}

/// BatchReadOnlyTransaction is a ReadOnlyTransaction that allows for exporting
/// arbitrarily large amounts of data from Cloud Spanner databases.
/// BatchReadOnlyTransaction partitions a read/query request. Read/query request
/// can then be executed independently over each partition while observing the
/// same snapshot of the database.
pub struct BatchReadOnlyTransaction {
    base_tx: ReadOnlyTransaction,
}

impl Deref for BatchReadOnlyTransaction {
    type Target = ReadOnlyTransaction;

    fn deref(&self) -> &Self::Target {
        &self.base_tx
    }
}

impl DerefMut for BatchReadOnlyTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base_tx
    }
}

impl BatchReadOnlyTransaction {
    pub(crate) async fn begin(
        session: ManagedSession,
        tb: TimestampBound,
        options: CallOptions,
        defaults: &TransactionDefaults,
    ) -> Result<BatchReadOnlyTransaction, Status> {
        let tx = ReadOnlyTransaction::begin(session, tb, options, defaults).await?;
        Ok(BatchReadOnlyTransaction { base_tx: tx })
    }

    fn id_selector(&self) -> Result<crate::apiv1::types::TransactionSelector, Status> {
        self.context
            .id_selector()
            .ok_or_else(|| Status::failed_precondition("batch read-only transaction has no id"))
    }

    /// partition_read returns a list of Partitions that can be used to read rows from
    /// the database. These partitions can be executed across multiple processes,
    /// even across different machines. The partition size and count hints can be
    /// configured using PartitionOptions.
    pub async fn partition_read(
        &self,
        table: &str,
        columns: &[&str],
        keys: impl Into<KeySet> + Clone,
    ) -> Result<Vec<Partition<TableReader>>, Status> {
        self.partition_read_with_option(table, columns, keys, None, ReadOptions::default())
            .await
    }

    /// partition_read_with_option returns a list of Partitions that can be used to read rows from
    /// the database. Set `data_boost_enabled` in the options to run the partitions on
    /// independent compute resources.
    pub async fn partition_read_with_option(
        &self,
        table: &str,
        columns: &[&str],
        keys: impl Into<KeySet> + Clone,
        po: Option<PartitionOptions>,
        ro: ReadOptions,
    ) -> Result<Vec<Partition<TableReader>>, Status> {
        let columns: Vec<String> = columns.iter().map(|x| x.to_string()).collect();
        let inner_keyset = keys.into().inner;
        let selector = self.id_selector()?;
        let request = PartitionReadRequest {
            session: self.session_name().to_string(),
            transaction: Some(selector.clone()),
            table: table.to_string(),
            index: ro.index.clone(),
            columns: columns.clone(),
            key_set: Some(inner_keyset.clone()),
            partition_options: po,
        };
        let result = self
            .session
            .spanner_client
            .partition_read(request, ro.call_options.retry.clone())
            .await;
        let response = self.session.invalidate_if_needed(result).await?;
        let request_options = self.create_request_options(ro.request_options.clone());
        Ok(response
            .into_inner()
            .partitions
            .into_iter()
            .map(|x| Partition {
                reader: TableReader {
                    request: ReadRequest {
                        session: self.session_name().to_string(),
                        transaction: Some(selector.clone()),
                        table: table.to_string(),
                        index: ro.index.clone(),
                        columns: columns.clone(),
                        key_set: Some(inner_keyset.clone()),
                        limit: ro.limit,
                        resume_token: vec![],
                        partition_token: x.partition_token,
                        request_options: request_options.clone(),
                        directed_read_options: ro.directed_read_options.clone(),
                        data_boost_enabled: ro.data_boost_enabled,
                    },
                },
            })
            .collect())
    }

    /// partition_query returns a list of Partitions that can be used to execute a query against the database.
    pub async fn partition_query(&self, stmt: Statement) -> Result<Vec<Partition<StatementReader>>, Status> {
        self.partition_query_with_option(stmt, None, QueryOptions::default())
            .await
    }

    /// partition_query_with_option returns a list of Partitions that can be used to execute a query against the database.
    pub async fn partition_query_with_option(
        &self,
        stmt: Statement,
        po: Option<PartitionOptions>,
        qo: QueryOptions,
    ) -> Result<Vec<Partition<StatementReader>>, Status> {
        let selector = self.id_selector()?;
        let params = stmt.params_struct();
        let request = PartitionQueryRequest {
            session: self.session_name().to_string(),
            transaction: Some(selector.clone()),
            sql: stmt.sql.clone(),
            params: params.clone(),
            param_types: stmt.param_types.clone(),
            partition_options: po,
        };
        let result = self
            .session
            .spanner_client
            .partition_query(request, qo.call_options.retry.clone())
            .await;
        let response = self.session.invalidate_if_needed(result).await?;
        let query_options = merge_query_options(qo.optimizer_options.clone(), self.default_query_options.as_ref());
        let request_options = self.create_request_options(qo.request_options.clone());
        Ok(response
            .into_inner()
            .partitions
            .into_iter()
            .map(|x| Partition {
                reader: StatementReader {
                    enable_resume: qo.enable_resume,
                    request: ExecuteSqlRequest {
                        session: self.session_name().to_string(),
                        transaction: Some(selector.clone()),
                        sql: stmt.sql.clone(),
                        params: params.clone(),
                        param_types: stmt.param_types.clone(),
                        resume_token: vec![],
                        query_mode: qo.mode,
                        partition_token: x.partition_token,
                        seqno: 0,
                        query_options: query_options.clone(),
                        request_options: request_options.clone(),
                        directed_read_options: qo.directed_read_options.clone(),
                        data_boost_enabled: qo.data_boost_enabled,
                        last_statement: false,
                    },
                },
            })
            .collect())
    }

    /// execute runs a single Partition obtained from partition_read or partition_query.
    pub async fn execute<T: Reader>(
        &self,
        partition: Partition<T>,
        option: Option<CallOptions>,
    ) -> Result<RowIterator<'_, T>, Status> {
        RowIterator::new(&self.session, partition.reader, option, false, None, None).await
    }
}
