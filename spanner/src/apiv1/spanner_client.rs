use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Code, Request, Response, Status};

use crate::apiv1::types::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, CommitRequest, CommitResponse, CreateSessionRequest, DeleteSessionRequest,
    ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest, GetSessionRequest, ListSessionsRequest,
    ListSessionsResponse, PartialResultSet, PartitionQueryRequest, PartitionReadRequest, PartitionResponse,
    ReadRequest, ResultSet, RollbackRequest, Session, Transaction,
};
use crate::request_id::{RequestId, RequestIdGenerator, REQUEST_ID_HEADER};
use crate::retry::{invoke_fn, RetrySetting};

pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
pub const ROUTE_TO_LEADER_HEADER: &str = "x-goog-spanner-route-to-leader";

/// Server streaming response body.
pub type Streaming<T> = BoxStream<'static, Result<T, Status>>;

/// The RPC surface of the `google.spanner.v1.Spanner` service.
///
/// Implementations own the channel (tonic, an emulator connection or an in-process fake) and
/// must forward the request metadata unchanged.
#[async_trait]
pub trait SpannerStub: Send + Sync {
    async fn create_session(&self, req: Request<CreateSessionRequest>) -> Result<Response<Session>, Status>;

    async fn batch_create_sessions(
        &self,
        req: Request<BatchCreateSessionsRequest>,
    ) -> Result<Response<BatchCreateSessionsResponse>, Status>;

    async fn get_session(&self, req: Request<GetSessionRequest>) -> Result<Response<Session>, Status>;

    async fn list_sessions(&self, req: Request<ListSessionsRequest>) -> Result<Response<ListSessionsResponse>, Status>;

    async fn delete_session(&self, req: Request<DeleteSessionRequest>) -> Result<Response<()>, Status>;

    async fn execute_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<Response<ResultSet>, Status>;

    async fn execute_streaming_sql(
        &self,
        req: Request<ExecuteSqlRequest>,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status>;

    async fn execute_batch_dml(
        &self,
        req: Request<ExecuteBatchDmlRequest>,
    ) -> Result<Response<ExecuteBatchDmlResponse>, Status>;

    async fn read(&self, req: Request<ReadRequest>) -> Result<Response<ResultSet>, Status>;

    async fn streaming_read(&self, req: Request<ReadRequest>) -> Result<Response<Streaming<PartialResultSet>>, Status>;

    async fn begin_transaction(&self, req: Request<BeginTransactionRequest>) -> Result<Response<Transaction>, Status>;

    async fn commit(&self, req: Request<CommitRequest>) -> Result<Response<CommitResponse>, Status>;

    async fn rollback(&self, req: Request<RollbackRequest>) -> Result<Response<()>, Status>;

    async fn partition_query(&self, req: Request<PartitionQueryRequest>)
        -> Result<Response<PartitionResponse>, Status>;

    async fn partition_read(&self, req: Request<PartitionReadRequest>) -> Result<Response<PartitionResponse>, Status>;

    async fn batch_write(
        &self,
        req: Request<BatchWriteRequest>,
    ) -> Result<Response<Streaming<BatchWriteResponse>>, Status>;
}

pub(crate) fn ping_query_request(session_name: impl Into<String>) -> ExecuteSqlRequest {
    ExecuteSqlRequest {
        session: session_name.into(),
        sql: "SELECT 1".to_string(),
        ..Default::default()
    }
}

fn default_setting() -> RetrySetting {
    RetrySetting {
        from_millis: 50,
        max_delay: Some(Duration::from_secs(10)),
        factor: 1u64,
        take: 20,
        codes: vec![Code::Unavailable, Code::Unknown],
    }
}

/// Commit is not idempotent: an attempt whose outcome is unknown must never be replayed.
fn commit_setting() -> RetrySetting {
    RetrySetting {
        take: 0,
        codes: vec![],
        ..default_setting()
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<dyn SpannerStub>,
    channel_id: u32,
    request_ids: Arc<RequestIdGenerator>,
    resource_prefix: MetadataValue<Ascii>,
    route_to_leader_enabled: bool,
    timeout: Option<Duration>,
}

impl Client {
    /// create new spanner client
    pub fn new(
        inner: Arc<dyn SpannerStub>,
        channel_id: u32,
        request_ids: Arc<RequestIdGenerator>,
        resource_prefix: MetadataValue<Ascii>,
    ) -> Client {
        Client {
            inner,
            channel_id,
            request_ids,
            resource_prefix,
            route_to_leader_enabled: true,
            timeout: None,
        }
    }

    pub fn with_route_to_leader(mut self, enabled: bool) -> Self {
        self.route_to_leader_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Starts a logical request whose attempts share one request id.
    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next(self.channel_id)
    }

    fn create_request<T>(&self, request_id: &RequestId, route_to_leader: bool, message: T) -> Request<T> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(RESOURCE_PREFIX_HEADER, self.resource_prefix.clone());
        if let Ok(value) = MetadataValue::try_from(request_id.to_string()) {
            metadata.insert(REQUEST_ID_HEADER, value);
        }
        if route_to_leader && self.route_to_leader_enabled {
            metadata.insert(ROUTE_TO_LEADER_HEADER, MetadataValue::from_static("true"));
        }
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }

    /// create_session creates a new session. A session can be used to perform
    /// transactions that read and/or modify data in a Cloud Spanner database.
    /// Sessions are meant to be reused for many consecutive
    /// transactions.
    ///
    /// Sessions can only execute one transaction at a time. To execute
    /// multiple concurrent read-write/write-only transactions, create
    /// multiple sessions. Multiplexed sessions are the exception.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Session>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.create_session(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// batch_create_sessions creates multiple new sessions.
    /// The server may return fewer sessions than requested.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn batch_create_sessions(
        &self,
        req: BatchCreateSessionsRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<BatchCreateSessionsResponse>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.batch_create_sessions(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// get_session gets a session. Returns NOT_FOUND if the session does not exist.
    /// This is mainly useful for determining whether a session is still alive.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get_session(
        &self,
        req: GetSessionRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Session>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, false, req.clone());
                async move { self.inner.get_session(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// list_sessions lists all sessions in a given database.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list_sessions(
        &self,
        req: ListSessionsRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, false, req.clone());
                async move { self.inner.list_sessions(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// delete_session ends a session, releasing server resources associated with it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete_session(
        &self,
        req: DeleteSessionRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<()>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, false, req.clone());
                async move { self.inner.delete_session(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// execute_sql executes an SQL statement, returning all results in a single reply. This
    /// method cannot be used to return a result set larger than 10 MiB;
    /// if the query yields more data than that, the query fails with
    /// a FAILED_PRECONDITION error.
    ///
    /// Operations inside read-write transactions might return ABORTED. If
    /// this occurs, the application should restart the transaction from
    /// the beginning.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute_sql(
        &self,
        req: ExecuteSqlRequest,
        route_to_leader: bool,
        retry: Option<RetrySetting>,
    ) -> Result<Response<ResultSet>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, route_to_leader, req.clone());
                async move { self.inner.execute_sql(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// execute_streaming_sql like execute_sql, except returns the result
    /// set as a stream. Unlike execute_sql, there
    /// is no limit on the size of the returned result set. However, no
    /// individual row in the result set can exceed 100 MiB, and no
    /// column value can exceed 10 MiB.
    ///
    /// `request_id` is owned by the caller so that a resumed stream is reported as another
    /// attempt of the same logical request.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute_streaming_sql(
        &self,
        req: ExecuteSqlRequest,
        request_id: &mut RequestId,
        route_to_leader: bool,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |request_id| {
                request_id.next_attempt();
                let request = self.create_request(request_id, route_to_leader, req.clone());
                async move { self.inner.execute_streaming_sql(request).await.map_err(|e| (e, request_id)) }
            },
            request_id,
        )
        .await
    }

    /// execute_batch_dml executes a batch of SQL DML statements. This method allows many statements
    /// to be run with lower latency than submitting them sequentially with
    /// execute_sql.
    ///
    /// Statements are executed in sequential order. A request can succeed even if
    /// a statement fails. The status field in the response provides information about
    /// the statement that failed. Clients must inspect this field to determine whether an error occurred.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute_batch_dml(
        &self,
        req: ExecuteBatchDmlRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<ExecuteBatchDmlResponse>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.execute_batch_dml(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// read reads rows from the database using key lookups and scans, as a
    /// simple key/value style alternative to execute_sql.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn read(
        &self,
        req: ReadRequest,
        route_to_leader: bool,
        retry: Option<RetrySetting>,
    ) -> Result<Response<ResultSet>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, route_to_leader, req.clone());
                async move { self.inner.read(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// streaming_read like read, except returns the result set as a
    /// stream. Unlike read, there is no limit on the
    /// size of the returned result set.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn streaming_read(
        &self,
        req: ReadRequest,
        request_id: &mut RequestId,
        route_to_leader: bool,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |request_id| {
                request_id.next_attempt();
                let request = self.create_request(request_id, route_to_leader, req.clone());
                async move { self.inner.streaming_read(request).await.map_err(|e| (e, request_id)) }
            },
            request_id,
        )
        .await
    }

    /// begin_transaction begins a new transaction. This step can often be skipped:
    /// read, execute_sql and
    /// commit can begin a new transaction as a
    /// side-effect.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn begin_transaction(
        &self,
        req: BeginTransactionRequest,
        route_to_leader: bool,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Transaction>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, route_to_leader, req.clone());
                async move { self.inner.begin_transaction(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// commit commits a transaction. The request includes the mutations to be
    /// applied to rows in the database.
    ///
    /// commit might return an ABORTED error. This can occur at any time;
    /// commonly, the cause is conflicts with concurrent
    /// transactions. However, it can also happen for a variety of other
    /// reasons. If commit returns ABORTED, the caller should re-attempt
    /// the transaction from the beginning, re-using the same session.
    ///
    /// Commit is attempted once unless `retry` is given explicitly.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn commit(&self, req: CommitRequest, retry: Option<RetrySetting>) -> Result<Response<CommitResponse>, Status> {
        let setting = retry.unwrap_or_else(commit_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.commit(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// rollback rolls back a transaction, releasing any locks it holds. It is a good
    /// idea to call this for any transaction that includes one or more
    /// read or execute_sql requests and ultimately
    /// decides not to commit.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn rollback(&self, req: RollbackRequest, retry: Option<RetrySetting>) -> Result<Response<()>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.rollback(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// partition_query creates a set of partition tokens that can be used to execute a query
    /// operation in parallel. Each of the returned partition tokens can be used
    /// by execute_streaming_sql to specify a subset
    /// of the query result to read. The same session and read-only transaction
    /// must be used by the PartitionQueryRequest used to create the
    /// partition tokens and the ExecuteSqlRequests that use the partition tokens.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn partition_query(
        &self,
        req: PartitionQueryRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<PartitionResponse>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, false, req.clone());
                async move { self.inner.partition_query(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// partition_read creates a set of partition tokens that can be used to execute a read
    /// operation in parallel. Each of the returned partition tokens can be used
    /// by streaming_read to specify a subset of the read
    /// result to read.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn partition_read(
        &self,
        req: PartitionReadRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<PartitionResponse>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, false, req.clone());
                async move { self.inner.partition_read(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }

    /// batch_write applies groups of mutations. Mutations in a group are committed
    /// atomically, groups are not. The response stream reports the outcome of each group.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn batch_write(
        &self,
        req: BatchWriteRequest,
        retry: Option<RetrySetting>,
    ) -> Result<Response<Streaming<BatchWriteResponse>>, Status> {
        let setting = retry.unwrap_or_else(default_setting);
        invoke_fn(
            None,
            Some(setting),
            |mut request_id| {
                request_id.next_attempt();
                let request = self.create_request(&request_id, true, req.clone());
                async move { self.inner.batch_write(request).await.map_err(|e| (e, request_id)) }
            },
            self.next_request_id(),
        )
        .await
    }
}
