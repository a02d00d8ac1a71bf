use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use prost_types::value::Kind;
use prost_types::{Timestamp, Value};
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};

use gcloud_spanner_core::apiv1::conn_pool::Connector;
use gcloud_spanner_core::apiv1::spanner_client::{SpannerStub, Streaming, ROUTE_TO_LEADER_HEADER};
use gcloud_spanner_core::apiv1::types::transaction_selector::Selector;
use gcloud_spanner_core::apiv1::types::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, CommitRequest, CommitResponse, CreateSessionRequest, DeleteSessionRequest,
    ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest, Field, GetSessionRequest,
    ListSessionsRequest, ListSessionsResponse, PartialResultSet, PartitionQueryRequest, PartitionReadRequest,
    PartitionResponse, ReadRequest, ResultSet, ResultSetMetadata, ResultSetStats, RollbackRequest, RowCount, Session,
    StructType, Transaction, TransactionSelector, Type, TypeCode,
};
use gcloud_spanner_core::client::{ChannelConfig, Client, ClientConfig};
use gcloud_spanner_core::request_id::REQUEST_ID_HEADER;
use gcloud_spanner_core::retry::RetryInfo;
use gcloud_spanner_core::session::{PoolKind, SessionConfig};

pub const DATABASE: &str = "projects/local-project/instances/test-instance/databases/local-database";

#[ctor::ctor]
unsafe fn init() {
    let filter = tracing_subscriber::filter::EnvFilter::from_default_env()
        .add_directive("gcloud_spanner_core=trace".parse().unwrap());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// One RPC received by the fake.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct Call {
    pub method: &'static str,
    pub session: String,
    pub request_id: String,
    pub route_to_leader: bool,
    pub selector: Option<Selector>,
    pub resume_token: Vec<u8>,
    pub seqno: i64,
    pub at: Instant,
}

#[allow(dead_code)]
impl Call {
    pub fn is_begin(&self) -> bool {
        matches!(self.selector, Some(Selector::Begin(_)))
    }

    pub fn is_id(&self) -> bool {
        matches!(self.selector, Some(Selector::Id(_)))
    }
}

/// Responses handed out in order. Empty queues fall back to a default answer.
#[derive(Default)]
pub struct Script {
    pub streams: VecDeque<Vec<Result<PartialResultSet, Status>>>,
    pub execute_sql: VecDeque<Result<ResultSet, Status>>,
    pub commits: VecDeque<Result<CommitResponse, Status>>,
    pub batch_dml: VecDeque<ExecuteBatchDmlResponse>,
    pub batch_writes: VecDeque<Vec<BatchWriteResponse>>,
}

/// In-process Spanner used by the integration tests.
#[derive(Default)]
pub struct MockSpanner {
    pub script: Mutex<Script>,
    /// Delay before each streamed fragment.
    pub fragment_delay: Mutex<Option<Duration>>,
    /// The next data request reports its session as lost.
    pub lose_next_session: AtomicBool,
    calls: Mutex<Vec<Call>>,
    commit_requests: Mutex<Vec<CommitRequest>>,
    lost_sessions: Mutex<HashSet<String>>,
    deleted_sessions: Mutex<Vec<String>>,
    next_session: AtomicUsize,
    next_transaction: AtomicUsize,
}

#[allow(dead_code)]
impl MockSpanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, method: &str) -> Vec<Call> {
        self.calls.lock().iter().filter(|c| c.method == method).cloned().collect()
    }

    pub fn commit_requests(&self) -> Vec<CommitRequest> {
        self.commit_requests.lock().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.next_session.load(Ordering::SeqCst)
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.deleted_sessions.lock().clone()
    }

    pub fn push_stream(&self, fragments: Vec<Result<PartialResultSet, Status>>) {
        self.script.lock().streams.push_back(fragments);
    }

    pub fn push_execute_sql(&self, result: Result<ResultSet, Status>) {
        self.script.lock().execute_sql.push_back(result);
    }

    pub fn push_commit(&self, result: Result<CommitResponse, Status>) {
        self.script.lock().commits.push_back(result);
    }

    pub fn push_batch_dml(&self, response: ExecuteBatchDmlResponse) {
        self.script.lock().batch_dml.push_back(response);
    }

    fn record<T>(&self, method: &'static str, req: &Request<T>, session: &str, selector: Option<&TransactionSelector>) {
        self.record_with(method, req, session, selector, vec![], 0)
    }

    fn record_with<T>(
        &self,
        method: &'static str,
        req: &Request<T>,
        session: &str,
        selector: Option<&TransactionSelector>,
        resume_token: Vec<u8>,
        seqno: i64,
    ) {
        let metadata = req.metadata();
        let request_id = metadata
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let route_to_leader = metadata.get(ROUTE_TO_LEADER_HEADER).is_some();
        self.calls.lock().push(Call {
            method,
            session: session.to_string(),
            request_id,
            route_to_leader,
            selector: selector.and_then(|s| s.selector.clone()),
            resume_token,
            seqno,
            at: Instant::now(),
        });
    }

    fn check_session(&self, session: &str) -> Result<(), Status> {
        if self.lose_next_session.swap(false, Ordering::SeqCst) {
            self.lost_sessions.lock().insert(session.to_string());
        }
        if self.lost_sessions.lock().contains(session) {
            return Err(Status::not_found(format!("Session not found: {session}")));
        }
        Ok(())
    }

    fn new_session(&self, database: &str, multiplexed: bool) -> Session {
        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Session {
            name: format!("{database}/sessions/s{n}"),
            multiplexed,
            ..Default::default()
        }
    }

    fn new_transaction(&self) -> Transaction {
        let n = self.next_transaction.fetch_add(1, Ordering::SeqCst) + 1;
        Transaction {
            id: format!("tx{n}").into_bytes(),
            read_timestamp: Some(Timestamp { seconds: 1, nanos: 0 }),
            precommit_token: None,
        }
    }

    /// Attaches a new transaction to the metadata when the request began one inline.
    fn begin_inline(&self, selector: Option<&TransactionSelector>, metadata: &mut Option<ResultSetMetadata>) {
        if matches!(selector.and_then(|s| s.selector.as_ref()), Some(Selector::Begin(_))) {
            metadata.get_or_insert_with(Default::default).transaction = Some(self.new_transaction());
        }
    }

    fn stream(
        &self,
        selector: Option<&TransactionSelector>,
        mut fragments: Vec<Result<PartialResultSet, Status>>,
    ) -> Streaming<PartialResultSet> {
        if let Some(Ok(first)) = fragments.first_mut() {
            self.begin_inline(selector, &mut first.metadata);
        }
        let delay = *self.fragment_delay.lock();
        futures_util::stream::iter(fragments)
            .then(move |fragment| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                fragment
            })
            .boxed()
    }

    fn next_stream(&self) -> Vec<Result<PartialResultSet, Status>> {
        self.script
            .lock()
            .streams
            .pop_front()
            .unwrap_or_else(|| vec![Ok(single_row("1"))])
    }
}

#[async_trait]
impl SpannerStub for MockSpanner {
    async fn create_session(&self, req: Request<CreateSessionRequest>) -> Result<Response<Session>, Status> {
        self.record("CreateSession", &req, "", None);
        let req = req.into_inner();
        let multiplexed = req.session.map(|s| s.multiplexed).unwrap_or_default();
        Ok(Response::new(self.new_session(&req.database, multiplexed)))
    }

    async fn batch_create_sessions(
        &self,
        req: Request<BatchCreateSessionsRequest>,
    ) -> Result<Response<BatchCreateSessionsResponse>, Status> {
        self.record("BatchCreateSessions", &req, "", None);
        let req = req.into_inner();
        let session = (0..req.session_count)
            .map(|_| self.new_session(&req.database, false))
            .collect();
        Ok(Response::new(BatchCreateSessionsResponse { session }))
    }

    async fn get_session(&self, req: Request<GetSessionRequest>) -> Result<Response<Session>, Status> {
        let name = req.get_ref().name.clone();
        self.record("GetSession", &req, &name, None);
        self.check_session(&name)?;
        Ok(Response::new(Session {
            name,
            ..Default::default()
        }))
    }

    async fn list_sessions(&self, req: Request<ListSessionsRequest>) -> Result<Response<ListSessionsResponse>, Status> {
        self.record("ListSessions", &req, "", None);
        Ok(Response::new(ListSessionsResponse::default()))
    }

    async fn delete_session(&self, req: Request<DeleteSessionRequest>) -> Result<Response<()>, Status> {
        let name = req.get_ref().name.clone();
        self.record("DeleteSession", &req, &name, None);
        self.deleted_sessions.lock().push(name);
        Ok(Response::new(()))
    }

    async fn execute_sql(&self, req: Request<ExecuteSqlRequest>) -> Result<Response<ResultSet>, Status> {
        let r = req.get_ref();
        self.record_with("ExecuteSql", &req, &r.session, r.transaction.as_ref(), vec![], r.seqno);
        self.check_session(&r.session)?;
        let scripted = self.script.lock().execute_sql.pop_front();
        let mut result_set = match scripted {
            Some(result) => result?,
            None => update_count(1),
        };
        self.begin_inline(r.transaction.as_ref(), &mut result_set.metadata);
        Ok(Response::new(result_set))
    }

    async fn execute_streaming_sql(
        &self,
        req: Request<ExecuteSqlRequest>,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let r = req.get_ref();
        self.record_with(
            "ExecuteStreamingSql",
            &req,
            &r.session,
            r.transaction.as_ref(),
            r.resume_token.clone(),
            r.seqno,
        );
        self.check_session(&r.session)?;
        let fragments = self.next_stream();
        Ok(Response::new(self.stream(r.transaction.as_ref(), fragments)))
    }

    async fn execute_batch_dml(
        &self,
        req: Request<ExecuteBatchDmlRequest>,
    ) -> Result<Response<ExecuteBatchDmlResponse>, Status> {
        let r = req.get_ref();
        self.record_with("ExecuteBatchDml", &req, &r.session, r.transaction.as_ref(), vec![], r.seqno);
        self.check_session(&r.session)?;
        let scripted = self.script.lock().batch_dml.pop_front();
        let mut response = scripted.unwrap_or_else(|| ExecuteBatchDmlResponse {
            result_sets: r.statements.iter().map(|_| update_count(1)).collect(),
            status: None,
            precommit_token: None,
        });
        if let Some(first) = response.result_sets.first_mut() {
            self.begin_inline(r.transaction.as_ref(), &mut first.metadata);
        }
        Ok(Response::new(response))
    }

    async fn read(&self, req: Request<ReadRequest>) -> Result<Response<ResultSet>, Status> {
        let r = req.get_ref();
        self.record("Read", &req, &r.session, r.transaction.as_ref());
        Err(Status::unimplemented("read"))
    }

    async fn streaming_read(&self, req: Request<ReadRequest>) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let r = req.get_ref();
        self.record_with("StreamingRead", &req, &r.session, r.transaction.as_ref(), r.resume_token.clone(), 0);
        self.check_session(&r.session)?;
        let fragments = self.next_stream();
        Ok(Response::new(self.stream(r.transaction.as_ref(), fragments)))
    }

    async fn begin_transaction(&self, req: Request<BeginTransactionRequest>) -> Result<Response<Transaction>, Status> {
        let session = req.get_ref().session.clone();
        self.record("BeginTransaction", &req, &session, None);
        self.check_session(&session)?;
        Ok(Response::new(self.new_transaction()))
    }

    async fn commit(&self, req: Request<CommitRequest>) -> Result<Response<CommitResponse>, Status> {
        let session = req.get_ref().session.clone();
        self.record("Commit", &req, &session, None);
        self.check_session(&session)?;
        self.commit_requests.lock().push(req.get_ref().clone());
        let scripted = self.script.lock().commits.pop_front();
        let response = match scripted {
            Some(result) => result?,
            None => committed(),
        };
        Ok(Response::new(response))
    }

    async fn rollback(&self, req: Request<RollbackRequest>) -> Result<Response<()>, Status> {
        let session = req.get_ref().session.clone();
        self.record("Rollback", &req, &session, None);
        Ok(Response::new(()))
    }

    async fn partition_query(
        &self,
        req: Request<PartitionQueryRequest>,
    ) -> Result<Response<PartitionResponse>, Status> {
        let r = req.get_ref();
        self.record("PartitionQuery", &req, &r.session, r.transaction.as_ref());
        Err(Status::unimplemented("partition_query"))
    }

    async fn partition_read(&self, req: Request<PartitionReadRequest>) -> Result<Response<PartitionResponse>, Status> {
        let r = req.get_ref();
        self.record("PartitionRead", &req, &r.session, r.transaction.as_ref());
        Err(Status::unimplemented("partition_read"))
    }

    async fn batch_write(
        &self,
        req: Request<BatchWriteRequest>,
    ) -> Result<Response<Streaming<BatchWriteResponse>>, Status> {
        let session = req.get_ref().session.clone();
        self.record("BatchWrite", &req, &session, None);
        self.check_session(&session)?;
        let responses = self.script.lock().batch_writes.pop_front().unwrap_or_default();
        Ok(Response::new(futures_util::stream::iter(responses.into_iter().map(Ok)).boxed()))
    }
}

pub struct MockConnector(pub Arc<MockSpanner>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn SpannerStub>, Status> {
        Ok(self.0.clone())
    }
}

#[allow(dead_code)]
pub fn fixed_pool(size: usize) -> SessionConfig {
    SessionConfig {
        max_opened: size,
        min_opened: size,
        max_idle: size,
        pool_kind: Some(PoolKind::FixedSize { size }),
        ..Default::default()
    }
}

pub async fn new_client(mock: &Arc<MockSpanner>, session_config: SessionConfig) -> Client {
    let config = ClientConfig {
        session_config,
        channel_config: ChannelConfig { num_channels: 1 },
        endpoint: "localhost:9010".to_string(),
        ..Default::default()
    };
    Client::new(DATABASE, config, &MockConnector(mock.clone()))
        .await
        .unwrap()
}

#[allow(dead_code)]
pub fn string_value(s: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

#[allow(dead_code)]
pub fn null_value() -> Value {
    Value {
        kind: Some(Kind::NullValue(0)),
    }
}

#[allow(dead_code)]
pub fn list_value(values: Vec<Value>) -> Value {
    Value {
        kind: Some(Kind::ListValue(prost_types::ListValue { values })),
    }
}

pub fn metadata(fields: Vec<Field>) -> Option<ResultSetMetadata> {
    Some(ResultSetMetadata {
        row_type: Some(StructType { fields }),
        transaction: None,
        undeclared_parameters: None,
    })
}

/// One INT64 column named `Value` with one row.
pub fn single_row(value: &str) -> PartialResultSet {
    PartialResultSet {
        metadata: metadata(vec![Field::new("Value", Type::new(TypeCode::Int64))]),
        values: vec![string_value(value)],
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn fragment(values: Vec<Value>, chunked_value: bool, resume_token: &str) -> PartialResultSet {
    PartialResultSet {
        values,
        chunked_value,
        resume_token: resume_token.as_bytes().to_vec(),
        ..Default::default()
    }
}

pub fn update_count(count: i64) -> ResultSet {
    ResultSet {
        stats: Some(ResultSetStats {
            query_stats: None,
            row_count: Some(RowCount::Exact(count)),
        }),
        ..Default::default()
    }
}

pub fn committed() -> CommitResponse {
    CommitResponse {
        commit_timestamp: Some(Timestamp {
            seconds: 1_700_000_000,
            nanos: 0,
        }),
        commit_stats: None,
        precommit_token: None,
    }
}

/// ABORTED carrying the server retry delay in the trailers.
#[allow(dead_code)]
pub fn aborted_with_delay(delay: Duration) -> Status {
    let info = RetryInfo {
        retry_delay: prost_types::Duration::try_from(delay).ok(),
    };
    let mut status = Status::aborted("Transaction was aborted.");
    status
        .metadata_mut()
        .insert_bin("google.rpc.retryinfo-bin", MetadataValue::from_bytes(&info.encode_to_vec()));
    status
}
