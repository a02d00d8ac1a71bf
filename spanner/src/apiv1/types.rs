//! Request and response messages of the `google.spanner.v1.Spanner` service.
//!
//! Only the fields the client core reads or writes are modelled. Wire values stay as
//! `prost_types::Value` so that the reassembler and the codecs can work on them directly.

use std::collections::HashMap;

use prost_types::{Duration, ListValue, Struct, Timestamp, Value};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub create_time: Option<Timestamp>,
    pub approximate_last_use_time: Option<Timestamp>,
    pub creator_role: String,
    pub multiplexed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TypeCode {
    #[default]
    Unspecified,
    Bool,
    Int64,
    Float32,
    Float64,
    Numeric,
    String,
    Bytes,
    Date,
    Timestamp,
    Json,
    Interval,
    Proto,
    Enum,
    Array,
    Struct,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Type {
    pub code: TypeCode,
    pub array_element_type: Option<Box<Type>>,
    pub struct_type: Option<StructType>,
    /// Fully qualified name of the message or enum for PROTO and ENUM columns.
    pub proto_type_fqn: String,
}

impl Type {
    pub fn new(code: TypeCode) -> Self {
        Type {
            code,
            ..Default::default()
        }
    }

    pub fn array(element: Type) -> Self {
        Type {
            code: TypeCode::Array,
            array_element_type: Some(Box::new(element)),
            ..Default::default()
        }
    }

    pub fn struct_of(fields: Vec<Field>) -> Self {
        Type {
            code: TypeCode::Struct,
            struct_type: Some(StructType { fields }),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructType {
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Field {
    pub name: String,
    pub r#type: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, r#type: Type) -> Self {
        Field {
            name: name.into(),
            r#type,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetMetadata {
    pub row_type: Option<StructType>,
    /// Set when the request began a transaction inline.
    pub transaction: Option<Transaction>,
    pub undeclared_parameters: Option<StructType>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultiplexedSessionPrecommitToken {
    pub precommit_token: Vec<u8>,
    pub seq_num: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub read_timestamp: Option<Timestamp>,
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowCount {
    Exact(i64),
    LowerBound(i64),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetStats {
    pub query_stats: Option<Struct>,
    pub row_count: Option<RowCount>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialResultSet {
    pub metadata: Option<ResultSetMetadata>,
    pub values: Vec<Value>,
    pub chunked_value: bool,
    pub resume_token: Vec<u8>,
    pub stats: Option<ResultSetStats>,
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
    pub last: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub metadata: Option<ResultSetMetadata>,
    pub rows: Vec<ListValue>,
    pub stats: Option<ResultSetStats>,
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
}

pub mod transaction_options {
    #[derive(Clone, Debug, PartialEq)]
    pub enum Mode {
        ReadWrite(ReadWrite),
        PartitionedDml(PartitionedDml),
        ReadOnly(ReadOnly),
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct ReadWrite {
        /// Id of the aborted transaction this attempt replaces on a multiplexed session.
        pub multiplexed_session_previous_transaction_id: Vec<u8>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct PartitionedDml {}

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct ReadOnly {
        pub timestamp_bound: Option<read_only::TimestampBound>,
        pub return_read_timestamp: bool,
    }

    pub mod read_only {
        use prost_types::{Duration, Timestamp};

        #[derive(Clone, Debug, PartialEq)]
        pub enum TimestampBound {
            Strong(bool),
            MinReadTimestamp(Timestamp),
            MaxStaleness(Duration),
            ReadTimestamp(Timestamp),
            ExactStaleness(Duration),
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub enum IsolationLevel {
        #[default]
        Unspecified,
        Serializable,
        RepeatableRead,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionOptions {
    pub mode: Option<transaction_options::Mode>,
    pub exclude_txn_from_change_streams: bool,
    pub isolation_level: transaction_options::IsolationLevel,
}

pub mod transaction_selector {
    use super::TransactionOptions;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Selector {
        SingleUse(TransactionOptions),
        Id(Vec<u8>),
        Begin(TransactionOptions),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionSelector {
    pub selector: Option<transaction_selector::Selector>,
}

pub mod request_options {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub enum Priority {
        #[default]
        Unspecified,
        Low,
        Medium,
        High,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub priority: request_options::Priority,
    pub request_tag: String,
    pub transaction_tag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub optimizer_version: String,
    pub optimizer_statistics_package: String,
}

pub mod directed_read_options {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub enum ReplicaType {
        #[default]
        Unspecified,
        ReadWrite,
        ReadOnly,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ReplicaSelection {
        pub location: String,
        pub r#type: ReplicaType,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Replicas {
        IncludeReplicas {
            replica_selections: Vec<ReplicaSelection>,
            auto_failover_disabled: bool,
        },
        ExcludeReplicas {
            replica_selections: Vec<ReplicaSelection>,
        },
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectedReadOptions {
    pub replicas: Option<directed_read_options::Replicas>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Normal,
    Plan,
    Profile,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteSqlRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub sql: String,
    pub params: Option<Struct>,
    pub param_types: HashMap<String, Type>,
    pub resume_token: Vec<u8>,
    pub query_mode: QueryMode,
    pub partition_token: Vec<u8>,
    pub seqno: i64,
    pub query_options: Option<QueryOptions>,
    pub request_options: Option<RequestOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
    pub data_boost_enabled: bool,
    pub last_statement: bool,
}

pub mod key_range {
    use prost_types::ListValue;

    #[derive(Clone, Debug, PartialEq)]
    pub enum StartKeyType {
        StartClosed(ListValue),
        StartOpen(ListValue),
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum EndKeyType {
        EndClosed(ListValue),
        EndOpen(ListValue),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyRange {
    pub start_key_type: Option<key_range::StartKeyType>,
    pub end_key_type: Option<key_range::EndKeyType>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeySet {
    pub keys: Vec<ListValue>,
    pub ranges: Vec<KeyRange>,
    pub all: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub key_set: Option<KeySet>,
    pub limit: i64,
    pub resume_token: Vec<u8>,
    pub partition_token: Vec<u8>,
    pub request_options: Option<RequestOptions>,
    pub directed_read_options: Option<DirectedReadOptions>,
    pub data_boost_enabled: bool,
}

pub mod execute_batch_dml_request {
    use std::collections::HashMap;

    use prost_types::Struct;

    use super::Type;

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Statement {
        pub sql: String,
        pub params: Option<Struct>,
        pub param_types: HashMap<String, Type>,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteBatchDmlRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub statements: Vec<execute_batch_dml_request::Statement>,
    pub seqno: i64,
    pub request_options: Option<RequestOptions>,
    pub last_statements: bool,
}

/// `google.rpc.Status` as carried inside a response body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteBatchDmlResponse {
    pub result_sets: Vec<ResultSet>,
    pub status: Option<RpcStatus>,
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BeginTransactionRequest {
    pub session: String,
    pub options: Option<TransactionOptions>,
    pub request_options: Option<RequestOptions>,
    /// Required for read-write transactions on multiplexed sessions that only write.
    pub mutation_key: Option<Mutation>,
}

pub mod commit_request {
    use super::TransactionOptions;

    #[derive(Clone, Debug, PartialEq)]
    pub enum Transaction {
        TransactionId(Vec<u8>),
        SingleUseTransaction(TransactionOptions),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitRequest {
    pub session: String,
    pub transaction: Option<commit_request::Transaction>,
    pub mutations: Vec<Mutation>,
    pub return_commit_stats: bool,
    pub max_commit_delay: Option<Duration>,
    pub request_options: Option<RequestOptions>,
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub mutation_count: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitResponse {
    pub commit_timestamp: Option<Timestamp>,
    pub commit_stats: Option<CommitStats>,
    /// Set when the server asks the client to retry the commit with a newer token.
    pub precommit_token: Option<MultiplexedSessionPrecommitToken>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackRequest {
    pub session: String,
    pub transaction_id: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateSessionRequest {
    pub database: String,
    pub session: Option<Session>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchCreateSessionsRequest {
    pub database: String,
    pub session_template: Option<Session>,
    pub session_count: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchCreateSessionsResponse {
    pub session: Vec<Session>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetSessionRequest {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListSessionsRequest {
    pub database: String,
    pub page_size: i32,
    pub page_token: String,
    pub filter: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
    pub next_page_token: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteSessionRequest {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionOptions {
    pub partition_size_bytes: i64,
    pub max_partitions: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionQueryRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub sql: String,
    pub params: Option<Struct>,
    pub param_types: HashMap<String, Type>,
    pub partition_options: Option<PartitionOptions>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionReadRequest {
    pub session: String,
    pub transaction: Option<TransactionSelector>,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub key_set: Option<KeySet>,
    pub partition_options: Option<PartitionOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub partition_token: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionResponse {
    pub partitions: Vec<Partition>,
    pub transaction: Option<Transaction>,
}

pub mod batch_write_request {
    use super::Mutation;

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct MutationGroup {
        pub mutations: Vec<Mutation>,
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteRequest {
    pub session: String,
    pub request_options: Option<RequestOptions>,
    pub mutation_groups: Vec<batch_write_request::MutationGroup>,
    pub exclude_txn_from_change_streams: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchWriteResponse {
    pub indexes: Vec<i32>,
    pub status: Option<RpcStatus>,
    pub commit_timestamp: Option<Timestamp>,
}

pub mod mutation {
    use prost_types::ListValue;

    use super::KeySet;

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Write {
        pub table: String,
        pub columns: Vec<String>,
        pub values: Vec<ListValue>,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Delete {
        pub table: String,
        pub key_set: Option<KeySet>,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum Operation {
        Insert(Write),
        Update(Write),
        InsertOrUpdate(Write),
        Replace(Write),
        Delete(Delete),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mutation {
    pub operation: Option<mutation::Operation>,
}
