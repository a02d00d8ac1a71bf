use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use prost::Message;
use prost_types::value::Kind;
use prost_types::{ListValue, Value};
use tokio::select;
use tokio::sync::MutexGuard;
use tonic::{Code, Response, Status};

use crate::apiv1::spanner_client::Streaming;
use crate::apiv1::types::{
    ExecuteSqlRequest, Field, PartialResultSet, ReadRequest, ResultSetMetadata, ResultSetStats, Type, TypeCode,
    TransactionSelector,
};
use crate::request_id::RequestId;
use crate::retry::StreamingRetry;
use crate::row::Row;
use crate::session::SessionHandle;
use crate::transaction::{CallOptions, TransactionContext};

pub trait Reader: Send + Sync {
    fn read(
        &self,
        session: &SessionHandle,
        request_id: &mut RequestId,
        option: Option<CallOptions>,
        route_to_leader: bool,
    ) -> impl Future<Output = Result<Response<Streaming<PartialResultSet>>, Status>> + Send;

    fn update_token(&mut self, resume_token: Vec<u8>);

    fn can_resume(&self) -> bool;

    /// Whether a broken stream may be reopened at all.
    fn retry_enabled(&self) -> bool {
        true
    }

    fn set_transaction_selector(&mut self, selector: TransactionSelector);
}

pub struct StatementReader {
    pub enable_resume: bool,
    pub request: ExecuteSqlRequest,
}

impl Reader for StatementReader {
    async fn read(
        &self,
        session: &SessionHandle,
        request_id: &mut RequestId,
        option: Option<CallOptions>,
        route_to_leader: bool,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let option = option.unwrap_or_default();
        let client = &session.spanner_client;
        let result = client
            .execute_streaming_sql(self.request.clone(), request_id, route_to_leader, option.retry)
            .await;
        session.invalidate_if_needed(result).await
    }

    fn update_token(&mut self, resume_token: Vec<u8>) {
        self.request.resume_token = resume_token;
    }

    fn can_resume(&self) -> bool {
        self.enable_resume && !self.request.resume_token.is_empty()
    }

    fn retry_enabled(&self) -> bool {
        self.enable_resume
    }

    fn set_transaction_selector(&mut self, selector: TransactionSelector) {
        self.request.transaction = Some(selector);
    }
}

pub struct TableReader {
    pub request: ReadRequest,
}

impl Reader for TableReader {
    async fn read(
        &self,
        session: &SessionHandle,
        request_id: &mut RequestId,
        option: Option<CallOptions>,
        route_to_leader: bool,
    ) -> Result<Response<Streaming<PartialResultSet>>, Status> {
        let option = option.unwrap_or_default();
        let client = &session.spanner_client;
        let result = client
            .streaming_read(self.request.clone(), request_id, route_to_leader, option.retry)
            .await;
        session.invalidate_if_needed(result).await
    }

    fn update_token(&mut self, resume_token: Vec<u8>) {
        self.request.resume_token = resume_token;
    }

    fn can_resume(&self) -> bool {
        !self.request.resume_token.is_empty()
    }

    fn set_transaction_selector(&mut self, selector: TransactionSelector) {
        self.request.transaction = Some(selector);
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
enum MergeError {
    #[error("values of type {0:?} can not be chunked")]
    Unmergeable(TypeCode),
    #[error("chunks kind mismatch for type {0:?}")]
    KindMismatch(TypeCode),
}

impl From<MergeError> for Status {
    fn from(e: MergeError) -> Self {
        Status::internal(format!("failed to merge chunked value: {e}"))
    }
}

pub struct ResultSet {
    fields: Arc<Vec<Field>>,
    index: Arc<HashMap<String, usize>>,
    rows: VecDeque<Value>,
    /// Tail of the previous fragment. It is merged into the first value of the next one.
    pending_chunk: Option<Value>,
}

impl ResultSet {
    fn new() -> Self {
        ResultSet {
            fields: Arc::new(vec![]),
            index: Arc::new(HashMap::new()),
            rows: VecDeque::new(),
            pending_chunk: None,
        }
    }

    fn next(&mut self) -> Option<Row> {
        let column_length = self.fields.len();
        if column_length == 0 || self.rows.len() < column_length {
            return None;
        }
        let values: Vec<Value> = self.rows.drain(..column_length).collect();
        Some(Row::new(Arc::clone(&self.index), Arc::clone(&self.fields), values))
    }

    fn has_metadata(&self) -> bool {
        !self.fields.is_empty()
    }

    fn set_metadata(&mut self, metadata: &ResultSetMetadata) {
        if self.has_metadata() {
            return;
        }
        if let Some(row_type) = &metadata.row_type {
            self.fields = Arc::new(row_type.fields.clone());
            // create index for Row::column_by_name("column_name")
            let mut index = HashMap::new();
            for (i, f) in self.fields.iter().enumerate() {
                index.insert(f.name.clone(), i);
            }
            self.index = Arc::new(index);
        }
    }

    /// Type of the value that follows the buffered ones.
    fn next_column_type(&self) -> Type {
        match self.fields.len() {
            0 => Type::default(),
            n => self.fields[self.rows.len() % n].r#type.clone(),
        }
    }

    fn add(&mut self, metadata: Option<&ResultSetMetadata>, mut values: Vec<Value>, chunked_value: bool) -> Result<(), Status> {
        if let Some(metadata) = metadata {
            self.set_metadata(metadata);
        }
        if values.is_empty() {
            return Ok(());
        }
        if let Some(previous_last) = self.pending_chunk.take() {
            let r#type = self.next_column_type();
            let current_first = values.remove(0);
            tracing::trace!("merge chunked value type={:?}", r#type.code);
            let merged = merge(&r#type, previous_last, current_first)?;
            values.insert(0, merged);
        }
        if chunked_value {
            self.pending_chunk = values.pop();
        }
        self.rows.extend(values);
        Ok(())
    }

    fn is_row_boundary(&self) -> bool {
        if self.pending_chunk.is_some() {
            return false;
        }
        match self.fields.len() {
            0 => self.rows.is_empty(),
            n => self.rows.len() % n == 0,
        }
    }

    /// Fails when the stream ended in the middle of a row.
    fn finish(&self) -> Result<(), Status> {
        if self.pending_chunk.is_some() {
            return Err(Status::internal("stream ended with a pending chunked value"));
        }
        if !self.rows.is_empty() {
            return Err(Status::internal(format!(
                "stream ended with an incomplete row: values={}, columns={}",
                self.rows.len(),
                self.fields.len()
            )));
        }
        Ok(())
    }
}

fn is_null(v: &Value) -> bool {
    matches!(v.kind, None | Some(Kind::NullValue(_)))
}

fn string_value(v: String) -> Value {
    Value {
        kind: Some(Kind::StringValue(v)),
    }
}

fn list_value(values: Vec<Value>) -> Value {
    Value {
        kind: Some(Kind::ListValue(ListValue { values })),
    }
}

/// Combines the tail of one fragment with the head of the next according to the column type.
fn merge(r#type: &Type, previous_last: Value, current_first: Value) -> Result<Value, MergeError> {
    let code = r#type.code;
    match code {
        TypeCode::Bool => Err(MergeError::Unmergeable(code)),
        TypeCode::Int64
        | TypeCode::String
        | TypeCode::Bytes
        | TypeCode::Date
        | TypeCode::Timestamp
        | TypeCode::Numeric
        | TypeCode::Json
        | TypeCode::Interval
        | TypeCode::Proto
        | TypeCode::Enum => match (previous_last.kind, current_first.kind) {
            (Some(Kind::StringValue(last)), Some(Kind::StringValue(first))) => Ok(string_value(last + &first)),
            _ => Err(MergeError::KindMismatch(code)),
        },
        TypeCode::Float32 | TypeCode::Float64 => match (previous_last.kind, current_first.kind) {
            (Some(Kind::StringValue(last)), Some(Kind::StringValue(first))) => Ok(string_value(last + &first)),
            (Some(Kind::NumberValue(last)), Some(Kind::StringValue(first))) if first.is_empty() => Ok(Value {
                kind: Some(Kind::NumberValue(last)),
            }),
            _ => Err(MergeError::Unmergeable(code)),
        },
        TypeCode::Array => match (previous_last.kind, current_first.kind) {
            (Some(Kind::ListValue(last)), Some(Kind::ListValue(first))) => {
                let element_type = r#type.array_element_type.as_deref().cloned().unwrap_or_default();
                Ok(list_value(merge_list(last.values, first.values, |_| element_type.clone())))
            }
            _ => Err(MergeError::KindMismatch(code)),
        },
        TypeCode::Struct => match (previous_last.kind, current_first.kind) {
            (Some(Kind::ListValue(last)), Some(Kind::ListValue(first))) => {
                let fields = r#type.struct_type.as_ref().map(|s| s.fields.as_slice()).unwrap_or(&[]);
                Ok(list_value(merge_list(last.values, first.values, |i| {
                    fields.get(i).map(|f| f.r#type.clone()).unwrap_or_default()
                })))
            }
            _ => Err(MergeError::KindMismatch(code)),
        },
        TypeCode::Unspecified => match (previous_last.kind, current_first.kind) {
            (Some(Kind::StringValue(last)), Some(Kind::StringValue(first))) => Ok(string_value(last + &first)),
            (Some(Kind::ListValue(last)), Some(Kind::ListValue(first))) => {
                Ok(list_value(merge_list(last.values, first.values, |_| Type::default())))
            }
            _ => Err(MergeError::Unmergeable(code)),
        },
    }
}

/// Joins two list chunks. The element at the seam is merged when both sides carry a
/// mergeable non-null value; otherwise the lists are concatenated as they are.
fn merge_list(mut last: Vec<Value>, mut first: Vec<Value>, seam_type: impl Fn(usize) -> Type) -> Vec<Value> {
    if last.is_empty() || first.is_empty() {
        last.extend(first);
        return last;
    }
    let seam = last.len() - 1;
    let r#type = seam_type(seam);
    if is_null(&last[seam]) || is_null(&first[0]) {
        last.extend(first);
        return last;
    }
    let (left, right) = (last[seam].clone(), first[0].clone());
    match merge(&r#type, left, right) {
        Ok(merged) => {
            last[seam] = merged;
            first.remove(0);
        }
        Err(e) => tracing::trace!("concatenate list chunks: {e}"),
    }
    last.extend(first);
    last
}

const DEFAULT_MAX_BYTES_BETWEEN_RESUME_TOKENS: usize = 128 * 1024 * 1024;

fn encoded_size(result_set: &PartialResultSet) -> usize {
    result_set.values.iter().map(|v| v.encoded_len()).sum::<usize>() + result_set.resume_token.len()
}

/// Withholds fragments until a resume token covering them has been seen, so that rows are
/// never handed out twice after a resume.
#[derive(Debug)]
struct ResumablePartialResultSetBuffer {
    pending: VecDeque<PartialResultSet>,
    last_delivered_token: Vec<u8>,
    observed_token: Vec<u8>,
    bytes_between_tokens: usize,
    max_bytes_between_tokens: usize,
    unretryable: bool,
}

impl ResumablePartialResultSetBuffer {
    fn new(max_bytes_between_tokens: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            last_delivered_token: Vec::new(),
            observed_token: Vec::new(),
            bytes_between_tokens: 0,
            max_bytes_between_tokens,
            unretryable: false,
        }
    }

    fn push(&mut self, result_set: PartialResultSet) {
        if !result_set.resume_token.is_empty() && result_set.resume_token != self.observed_token {
            self.observed_token = result_set.resume_token.clone();
        }

        if !self.unretryable && self.observed_token == self.last_delivered_token {
            self.bytes_between_tokens = self.bytes_between_tokens.saturating_add(encoded_size(&result_set));
            if self.bytes_between_tokens >= self.max_bytes_between_tokens {
                self.unretryable = true;
            }
        }

        self.pending.push_back(result_set);
    }

    fn pop_ready(&mut self, end_of_stream: bool) -> Option<PartialResultSet> {
        if self.pending.is_empty() {
            return None;
        }

        if self.unretryable || end_of_stream {
            return self.pending.pop_front();
        }

        if self.observed_token != self.last_delivered_token {
            let result_set = self.pending.pop_front();
            if let Some(ref rs) = result_set {
                if !rs.resume_token.is_empty() && rs.resume_token == self.observed_token {
                    self.last_delivered_token = self.observed_token.clone();
                    self.bytes_between_tokens = 0;
                }
            }
            return result_set;
        }

        None
    }

    fn on_resumption(&mut self) {
        self.pending.clear();
        self.observed_token = self.last_delivered_token.clone();
        self.bytes_between_tokens = 0;
        self.unretryable = false;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    AwaitingMetadata,
    Streaming,
    /// Reopening the stream from the last resume token.
    Resuming,
    /// Reopening the stream from the beginning. Only possible before any row was handed out.
    Restarting,
    Drained,
    Failed,
}

pub struct RowIterator<'a, T>
where
    T: Reader,
{
    streaming: Streaming<PartialResultSet>,
    session: &'a SessionHandle,
    transaction: Option<&'a TransactionContext>,
    begin_guard: Option<MutexGuard<'a, ()>>,
    reader: T,
    rs: ResultSet,
    reader_option: Option<CallOptions>,
    route_to_leader: bool,
    request_id: RequestId,
    stats: Option<ResultSetStats>,
    prs_buffer: ResumablePartialResultSetBuffer,
    resumable: bool,
    end_of_stream: bool,
    stream_retry: StreamingRetry,
    state: ReaderState,
    delivered: bool,
}

impl<'a, T> RowIterator<'a, T>
where
    T: Reader,
{
    pub(crate) async fn new(
        session: &'a SessionHandle,
        reader: T,
        option: Option<CallOptions>,
        route_to_leader: bool,
        transaction: Option<&'a TransactionContext>,
        begin_guard: Option<MutexGuard<'a, ()>>,
    ) -> Result<RowIterator<'a, T>, Status> {
        let mut request_id = session.spanner_client.next_request_id();
        let cancel = option.as_ref().and_then(|o| o.cancel.clone());
        let open = reader.read(session, &mut request_id, option.clone(), route_to_leader);
        let streaming = match cancel {
            Some(cancel) => select! {
                _ = cancel.cancelled() => return Err(Status::cancelled("client cancel")),
                v = open => v?,
            },
            None => open.await?,
        }
        .into_inner();
        let mut iter = Self {
            streaming,
            session,
            transaction,
            begin_guard,
            reader,
            rs: ResultSet::new(),
            reader_option: option,
            route_to_leader,
            request_id,
            stats: None,
            prs_buffer: ResumablePartialResultSetBuffer::new(DEFAULT_MAX_BYTES_BETWEEN_RESUME_TOKENS),
            resumable: true,
            end_of_stream: false,
            stream_retry: StreamingRetry::new(),
            state: ReaderState::AwaitingMetadata,
            delivered: false,
        };
        // other statements of the transaction wait for the id, so read until it arrives
        while iter.begin_guard.is_some() && !iter.end_of_stream {
            if let Err(e) = iter.receive().await {
                iter.fail();
                return Err(e);
            }
        }
        Ok(iter)
    }

    pub fn set_call_options(&mut self, option: CallOptions) {
        self.reader_option = Some(option);
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Token of the last fragment whose rows have been handed to the caller or buffered.
    pub fn resume_token(&self) -> &[u8] {
        &self.prs_buffer.last_delivered_token
    }

    fn fail(&mut self) {
        self.state = ReaderState::Failed;
        self.begin_guard = None;
    }

    /// Captures what the fragment tells about the transaction as soon as it arrives.
    fn observe(&mut self, result_set: &PartialResultSet) {
        if let Some(metadata) = &result_set.metadata {
            if self.state == ReaderState::AwaitingMetadata {
                self.state = ReaderState::Streaming;
            }
            if let (Some(tx), Some(ctx)) = (&metadata.transaction, self.transaction) {
                ctx.set_transaction(tx);
            }
            self.rs.set_metadata(metadata);
            self.begin_guard = None;
        }
        if let Some(ctx) = self.transaction {
            ctx.update_precommit_token(result_set.precommit_token.clone());
        }
    }

    /// Receives one message from the stream, reopening it when it breaks.
    async fn receive(&mut self) -> Result<(), Status> {
        match self.streaming.next().await {
            Some(Ok(result_set)) => {
                self.observe(&result_set);
                if result_set.last {
                    self.end_of_stream = true;
                }
                self.prs_buffer.push(result_set);
                if self.prs_buffer.unretryable {
                    self.resumable = false;
                }
                Ok(())
            }
            None => {
                self.end_of_stream = true;
                self.begin_guard = None;
                Ok(())
            }
            Some(Err(e)) => {
                self.session.observe_error(&e);
                self.reopen(e).await
            }
        }
    }

    async fn reopen(&mut self, status: Status) -> Result<(), Status> {
        if !self.resumable || !self.reader.retry_enabled() || !StreamingRetry::is_retryable(&status) {
            return Err(status);
        }
        if self.reader.can_resume() {
            tracing::debug!("streaming error: {}. resume reading by resume_token", status);
            self.state = ReaderState::Resuming;
        } else if !self.delivered {
            tracing::debug!("streaming error: {}. restart reading", status);
            if let Some(selector) = self.transaction.and_then(|ctx| ctx.id_selector()) {
                self.reader.set_transaction_selector(selector);
            }
            self.state = ReaderState::Restarting;
        } else {
            return Err(status);
        }
        self.stream_retry.next(status).await?;
        let result = self
            .reader
            .read(self.session, &mut self.request_id, self.reader_option.clone(), self.route_to_leader)
            .await?;
        self.streaming = result.into_inner();
        self.prs_buffer.on_resumption();
        self.state = if self.rs.has_metadata() {
            ReaderState::Streaming
        } else {
            ReaderState::AwaitingMetadata
        };
        Ok(())
    }

    /// Moves one ready fragment into the row buffer. Returns false at the end of the stream.
    async fn try_recv(&mut self) -> Result<bool, Status> {
        loop {
            if let Some(result_set) = self.prs_buffer.pop_ready(self.end_of_stream) {
                let resume_token_present = !result_set.resume_token.is_empty();
                //if resume_token changes set new resume_token
                if resume_token_present {
                    self.reader.update_token(result_set.resume_token.clone());
                }
                // stats are only sent with the last response
                if result_set.stats.is_some() {
                    self.stats = result_set.stats;
                }
                if !result_set.values.is_empty() {
                    self.delivered = true;
                }
                self.rs
                    .add(result_set.metadata.as_ref(), result_set.values, result_set.chunked_value)?;
                if resume_token_present && !self.rs.is_row_boundary() {
                    return Err(Status::new(Code::FailedPrecondition, "resume token is not on a row boundary"));
                }
                return Ok(true);
            }

            if self.end_of_stream {
                self.rs.finish()?;
                self.state = ReaderState::Drained;
                self.begin_guard = None;
                return Ok(false);
            }
            self.receive().await?;
        }
    }

    /// Return metadata for all columns
    pub fn columns_metadata(&self) -> &Arc<Vec<Field>> {
        &self.rs.fields
    }

    pub fn column_metadata(&self, column_name: &str) -> Option<(usize, Field)> {
        for (i, val) in self.rs.fields.iter().enumerate() {
            if val.name == column_name {
                return Some((i, val.clone()));
            }
        }
        None
    }

    /// Returns query execution statistics if available.
    /// Stats are only available after all rows have been consumed and only when
    /// the query was executed with a QueryMode that includes stats.
    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    async fn next_row(&mut self) -> Result<Option<Row>, Status> {
        loop {
            let row = self.rs.next();
            if row.is_some() {
                return Ok(row);
            }
            if self.state == ReaderState::Drained {
                return Ok(None);
            }
            // no data found or record chunked.
            if !self.try_recv().await? {
                return Ok(None);
            }
        }
    }

    /// next returns the next result.
    /// Its second return value is None if there are no more results.
    pub async fn next(&mut self) -> Result<Option<Row>, Status> {
        if self.state == ReaderState::Failed {
            return Err(Status::failed_precondition("row iterator already failed"));
        }
        let cancel = self.reader_option.as_ref().and_then(|o| o.cancel.clone());
        let result = match cancel {
            Some(cancel) => {
                let received = select! {
                    _ = cancel.cancelled() => None,
                    v = self.next_row() => Some(v),
                };
                received.unwrap_or_else(|| Err(Status::cancelled("client cancel")))
            }
            None => self.next_row().await,
        };
        if result.is_err() {
            self.fail();
        }
        result
    }
}
