use futures_util::StreamExt;
use tonic::{Code, Status};

use crate::apiv1::spanner_client::Streaming;
use crate::apiv1::types::commit_request::Transaction as CommitTransaction;
use crate::apiv1::types::{BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest, Mutation, RequestOptions};
use crate::mutation::{select_mutation_key, MutationGroup};
use crate::session::ManagedSession;
use crate::transaction::{with_cancel, CallOptions, TransactionContext, TransactionMode};
use crate::transaction_rw::{begin_with_retry, commit, CommitOptions, CommitResult, ReadWriteOptions};
use crate::value::Timestamp;

/// Commits mutations without reading. The commit may be applied more than once when it is
/// retried after an abort.
pub(crate) async fn commit_mutations(
    session: &ManagedSession,
    ms: Vec<Mutation>,
    options: &ReadWriteOptions,
    commit_options: CommitOptions,
) -> Result<CommitResult, Status> {
    let tx_options = options.transaction_options(None);
    let context = TransactionContext::new(
        TransactionMode::MutationOnly,
        tx_options.clone(),
        options.transaction_tag.clone(),
    );
    let transaction = if session.is_multiplexed() {
        // multiplexed sessions begin with a mutation key and commit with the returned token
        let request = BeginTransactionRequest {
            session: session.name().to_string(),
            options: Some(tx_options),
            request_options: context.request_options(None),
            mutation_key: select_mutation_key(&ms),
        };
        let tx = begin_with_retry(session, request, &commit_options.call_options).await?;
        context.set_transaction(&tx);
        CommitTransaction::TransactionId(tx.id)
    } else {
        CommitTransaction::SingleUseTransaction(tx_options)
    };
    let response = commit(session, &context, ms, transaction, commit_options).await?;
    Ok(response.into())
}

/// Outcome of one or more mutation groups.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchWriteResult {
    /// Indexes of the groups in the request.
    pub indexes: Vec<i32>,
    /// Status of the groups. The groups are applied when it is OK.
    pub code: Code,
    pub message: String,
    pub commit_timestamp: Option<Timestamp>,
}

impl BatchWriteResult {
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<BatchWriteResponse> for BatchWriteResult {
    fn from(value: BatchWriteResponse) -> Self {
        let (code, message) = match value.status {
            Some(s) => (Code::from_i32(s.code), s.message),
            None => (Code::Ok, String::new()),
        };
        Self {
            indexes: value.indexes,
            code,
            message,
            commit_timestamp: value.commit_timestamp.map(|t| t.into()),
        }
    }
}

/// Stream of group outcomes. The session stays checked out until the stream is dropped.
pub struct BatchWriteStream {
    // drop order: the stream is closed before the session is returned
    streaming: Streaming<BatchWriteResponse>,
    session: ManagedSession,
    cancel: Option<tokio_util::sync::CancellationToken>,
}

impl BatchWriteStream {
    pub async fn next(&mut self) -> Result<Option<BatchWriteResult>, Status> {
        let streaming = &mut self.streaming;
        let received = with_cancel(self.cancel.as_ref(), async move { streaming.next().await.transpose() }).await;
        match received {
            Ok(v) => Ok(v.map(BatchWriteResult::from)),
            Err(e) => {
                self.session.observe_error(&e);
                Err(e)
            }
        }
    }

    /// Reads all outcomes.
    pub async fn collect(mut self) -> Result<Vec<BatchWriteResult>, Status> {
        let mut results = vec![];
        while let Some(result) = self.next().await? {
            results.push(result);
        }
        Ok(results)
    }
}

#[derive(Clone, Default)]
pub struct BatchWriteOptions {
    pub exclude_txn_from_change_streams: bool,
    pub request_options: Option<RequestOptions>,
    pub call_options: CallOptions,
}

/// Applies the groups independently. Each group is committed atomically.
pub(crate) async fn batch_write(
    session: ManagedSession,
    groups: Vec<MutationGroup>,
    options: BatchWriteOptions,
) -> Result<BatchWriteStream, Status> {
    let request = BatchWriteRequest {
        session: session.name().to_string(),
        request_options: options.request_options,
        mutation_groups: groups.into_iter().map(|g| g.into()).collect(),
        exclude_txn_from_change_streams: options.exclude_txn_from_change_streams,
    };
    let cancel = options.call_options.cancel;
    let result = with_cancel(
        cancel.as_ref(),
        session.spanner_client.batch_write(request, options.call_options.retry),
    )
    .await;
    let streaming = session.invalidate_if_needed(result).await?.into_inner();
    Ok(BatchWriteStream {
        streaming,
        session,
        cancel,
    })
}

#[cfg(test)]
mod tests {
    use prost_types::Timestamp;
    use tonic::Code;

    use crate::apiv1::types::{BatchWriteResponse, RpcStatus};
    use crate::batch::BatchWriteResult;

    #[test]
    fn test_batch_write_result() {
        let ok: BatchWriteResult = BatchWriteResponse {
            indexes: vec![0, 2],
            status: None,
            commit_timestamp: Some(Timestamp { seconds: 10, nanos: 0 }),
        }
        .into();
        assert!(ok.is_ok());
        assert_eq!(ok.indexes, vec![0, 2]);
        assert_eq!(ok.commit_timestamp.unwrap().seconds, 10);

        let failed: BatchWriteResult = BatchWriteResponse {
            indexes: vec![1],
            status: Some(RpcStatus {
                code: Code::AlreadyExists as i32,
                message: "row exists".to_string(),
            }),
            commit_timestamp: None,
        }
        .into();
        assert!(!failed.is_ok());
        assert_eq!(failed.code, Code::AlreadyExists);
        assert_eq!(failed.message, "row exists");
    }
}
