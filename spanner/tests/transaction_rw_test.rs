use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use gcloud_spanner_core::apiv1::types::commit_request::Transaction as CommitTransaction;
use gcloud_spanner_core::apiv1::types::transaction_options::Mode;
use gcloud_spanner_core::apiv1::types::transaction_selector::Selector;
use gcloud_spanner_core::apiv1::types::{
    BatchWriteResponse, CommitResponse, ExecuteBatchDmlResponse, MultiplexedSessionPrecommitToken, ResultSet,
    RpcStatus, TransactionOptions,
};
use gcloud_spanner_core::client::{Error, ReadWriteTransactionOption};
use gcloud_spanner_core::mutation::{insert, MutationGroup};
use gcloud_spanner_core::session::SessionConfig;
use gcloud_spanner_core::statement::Statement;

mod common;
use common::*;

fn update_stmt() -> Statement {
    Statement::new("UPDATE Guild SET Name = 'renamed' WHERE GuildId = 'g1'")
}

#[tokio::test]
#[serial]
async fn test_inline_begin_and_commit() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let (commit, updated) = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let first = tx.update(update_stmt()).await?;
                let second = tx.update(update_stmt()).await?;
                Ok::<i64, Error>(first + second)
            })
        })
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(commit.timestamp.unwrap().seconds, 1_700_000_000);

    let calls = mock.calls_of("ExecuteSql");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_begin());
    assert!(calls[1].is_id());
    assert_eq!(calls[0].seqno, 1);
    assert_eq!(calls[1].seqno, 2);
    assert!(calls.iter().all(|c| c.route_to_leader));
    assert!(mock.calls_of("BeginTransaction").is_empty());

    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].transaction, Some(CommitTransaction::TransactionId(b"tx1".to_vec())));
}

#[tokio::test]
#[serial]
async fn test_aborted_commit_retried_on_same_session() {
    let mock = MockSpanner::new();
    mock.push_commit(Err(aborted_with_delay(Duration::from_millis(200))));
    let client = new_client(&mock, fixed_pool(2)).await;

    let (_, updated) = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let updated = tx.update(update_stmt()).await?;
                Ok::<i64, Error>(updated)
            })
        })
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let commits = mock.calls_of("Commit");
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].session, commits[1].session);
    assert!(commits[1].at.duration_since(commits[0].at) >= Duration::from_millis(200));

    // every attempt begins its own transaction
    let statements = mock.calls_of("ExecuteSql");
    assert_eq!(statements.len(), 2);
    assert!(statements.iter().all(|c| c.is_begin()));
    let requests = mock.commit_requests();
    assert_eq!(requests[1].transaction, Some(CommitTransaction::TransactionId(b"tx2".to_vec())));
}

#[tokio::test]
#[serial]
async fn test_session_not_found_retried_on_new_session() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(2)).await;
    mock.lose_next_session.store(true, std::sync::atomic::Ordering::SeqCst);

    let (_, updated) = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let updated = tx.update(update_stmt()).await?;
                Ok::<i64, Error>(updated)
            })
        })
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let statements = mock.calls_of("ExecuteSql");
    assert_eq!(statements.len(), 2);
    assert_ne!(statements[0].session, statements[1].session);
    let commits = mock.calls_of("Commit");
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].session, statements[1].session);

    let stats = client.session_pool_stats();
    assert_eq!(stats.num_discarded, 1);
    // the server already forgot the session
    assert!(!mock.deleted_sessions().contains(&statements[0].session));
}

#[tokio::test]
#[serial]
async fn test_commit_outcome_unknown_not_retried() {
    let mock = MockSpanner::new();
    mock.push_commit(Err(Status::unknown("connection reset")));
    let client = new_client(&mock, fixed_pool(1)).await;

    let result = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                tx.update(update_stmt()).await?;
                Ok::<(), Error>(())
            })
        })
        .await;
    assert!(matches!(result, Err(Error::CommitOutcomeUnknown(_))));
    assert_eq!(mock.calls_of("Commit").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_user_error_rolls_back() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let result = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                tx.update(update_stmt()).await?;
                Err::<(), Error>(Status::failed_precondition("guild is frozen").into())
            })
        })
        .await;
    match result {
        Err(Error::GRPC(status)) => assert_eq!(status.code(), tonic::Code::FailedPrecondition),
        _ => panic!("must fail"),
    }
    assert!(mock.calls_of("Commit").is_empty());
    assert_eq!(mock.calls_of("Rollback").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_cancel_rolls_back() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;
    let cancel = CancellationToken::new();
    let option = ReadWriteTransactionOption {
        cancel: Some(cancel.clone()),
        ..Default::default()
    };

    let result = client
        .read_write_transaction_with_option(
            |tx| {
                let cancel = cancel.clone();
                Box::pin(async move {
                    tx.update(update_stmt()).await?;
                    cancel.cancel();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<(), Error>(())
                })
            },
            option,
        )
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(mock.calls_of("Commit").is_empty());
    assert_eq!(mock.calls_of("Rollback").len(), 1);
    assert_eq!(client.session_pool_stats().num_inuse, 0);
}

#[tokio::test]
#[serial]
async fn test_apply_begins_before_commit() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let ms = vec![insert("Guild", &["GuildId", "Name"], &[&"g1", &"guild"])];
    let result = client.apply(ms).await.unwrap();
    assert!(result.timestamp.is_some());

    assert_eq!(mock.calls_of("BeginTransaction").len(), 1);
    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].mutations.len(), 1);
    assert_eq!(commits[0].transaction, Some(CommitTransaction::TransactionId(b"tx1".to_vec())));
}

#[tokio::test]
#[serial]
async fn test_apply_at_least_once() {
    let mock = MockSpanner::new();
    mock.push_commit(Err(aborted_with_delay(Duration::from_millis(10))));
    let client = new_client(&mock, fixed_pool(1)).await;

    let ms = vec![insert("Guild", &["GuildId", "Name"], &[&"g1", &"guild"])];
    client.apply_at_least_once(ms).await.unwrap();

    assert!(mock.calls_of("BeginTransaction").is_empty());
    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 2);
    assert!(commits
        .iter()
        .all(|c| matches!(c.transaction, Some(CommitTransaction::SingleUseTransaction(_)))));
    assert_eq!(commits[0].mutations, commits[1].mutations);
}

#[tokio::test]
#[serial]
async fn test_partitioned_update() {
    let mock = MockSpanner::new();
    mock.push_execute_sql(Ok(update_count(100)));
    let client = new_client(&mock, fixed_pool(1)).await;

    let updated = client
        .partitioned_update(Statement::new("DELETE FROM Guild WHERE true"))
        .await
        .unwrap();
    assert_eq!(updated, 100);
    assert_eq!(mock.calls_of("BeginTransaction").len(), 1);
    let statements = mock.calls_of("ExecuteSql");
    assert_eq!(statements.len(), 1);
    assert!(statements[0].is_id());
    assert!(mock.calls_of("Commit").is_empty());
}

#[tokio::test]
#[serial]
async fn test_batch_write() {
    let mock = MockSpanner::new();
    mock.script.lock().batch_writes.push_back(vec![
        BatchWriteResponse {
            indexes: vec![0],
            status: None,
            commit_timestamp: Some(prost_types::Timestamp { seconds: 5, nanos: 0 }),
        },
        BatchWriteResponse {
            indexes: vec![1],
            status: Some(RpcStatus {
                code: tonic::Code::AlreadyExists as i32,
                message: "row exists".to_string(),
            }),
            commit_timestamp: None,
        },
    ]);
    let client = new_client(&mock, fixed_pool(1)).await;

    let groups = vec![
        MutationGroup::new(vec![insert("Guild", &["GuildId"], &[&"g1"])]),
        MutationGroup::new(vec![insert("Guild", &["GuildId"], &[&"g2"])]),
    ];
    let stream = client.batch_write(groups).await.unwrap();
    assert_eq!(client.session_pool_stats().num_inuse, 1);
    let results = stream.collect().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert_eq!(results[1].code, tonic::Code::AlreadyExists);
    assert_eq!(client.session_pool_stats().num_inuse, 0);
}

fn token(value: &str, seq_num: i32) -> Option<MultiplexedSessionPrecommitToken> {
    Some(MultiplexedSessionPrecommitToken {
        precommit_token: value.as_bytes().to_vec(),
        seq_num,
    })
}

fn multiplexed_config() -> SessionConfig {
    SessionConfig {
        multiplexed: true,
        multiplexed_for_read_write: true,
        ..fixed_pool(1)
    }
}

#[tokio::test]
#[serial]
async fn test_batch_update_partial_failure() {
    let mock = MockSpanner::new();
    mock.push_batch_dml(ExecuteBatchDmlResponse {
        result_sets: vec![update_count(2)],
        status: Some(RpcStatus {
            code: tonic::Code::InvalidArgument as i32,
            message: "column not found".to_string(),
        }),
        precommit_token: None,
    });
    let client = new_client(&mock, fixed_pool(1)).await;

    let (_, status) = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let stmts = vec![update_stmt(), Statement::new("UPDATE Guild SET Missing = 1"), update_stmt()];
                let status = tx.batch_update(stmts).await.unwrap_err();
                Ok::<Status, Error>(status)
            })
        })
        .await
        .unwrap();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().starts_with("column not found"));
    assert!(status.message().contains("statement index=1"));
    assert!(status.message().contains("succeeded statements=[2]"));

    // the statements before the failure began the transaction
    let batches = mock.calls_of("ExecuteBatchDml");
    assert_eq!(batches.len(), 1);
    assert!(batches[0].is_begin());
    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].transaction, Some(CommitTransaction::TransactionId(b"tx1".to_vec())));
}

#[tokio::test]
#[serial]
async fn test_commit_echoes_highest_precommit_token() {
    let mock = MockSpanner::new();
    mock.push_execute_sql(Ok(ResultSet {
        precommit_token: token("first", 3),
        ..update_count(1)
    }));
    mock.push_execute_sql(Ok(ResultSet {
        precommit_token: token("stale", 2),
        ..update_count(1)
    }));
    mock.push_commit(Ok(CommitResponse {
        commit_timestamp: None,
        commit_stats: None,
        precommit_token: token("newer", 4),
    }));
    let client = new_client(&mock, multiplexed_config()).await;

    let (commit, updated) = client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let first = tx.update(update_stmt()).await?;
                let second = tx.update(update_stmt()).await?;
                Ok::<i64, Error>(first + second)
            })
        })
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(commit.timestamp.unwrap().seconds, 1_700_000_000);

    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].precommit_token, token("first", 3));
    assert_eq!(commits[1].precommit_token, token("newer", 4));
    assert_eq!(commits[0].transaction, commits[1].transaction);
    assert_eq!(commits[0].session, commits[1].session);
}

#[tokio::test]
#[serial]
async fn test_multiplexed_retry_sends_previous_transaction_id() {
    let mock = MockSpanner::new();
    mock.push_commit(Err(aborted_with_delay(Duration::from_millis(10))));
    let client = new_client(&mock, multiplexed_config()).await;

    client
        .read_write_transaction(|tx| {
            Box::pin(async move {
                let updated = tx.update(update_stmt()).await?;
                Ok::<i64, Error>(updated)
            })
        })
        .await
        .unwrap();

    let previous_id = |call: &Call| match &call.selector {
        Some(Selector::Begin(TransactionOptions {
            mode: Some(Mode::ReadWrite(rw)),
            ..
        })) => rw.multiplexed_session_previous_transaction_id.clone(),
        other => panic!("unexpected selector {other:?}"),
    };
    let statements = mock.calls_of("ExecuteSql");
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0].session, statements[1].session);
    assert!(previous_id(&statements[0]).is_empty());
    assert_eq!(previous_id(&statements[1]), b"tx1".to_vec());

    let commits = mock.commit_requests();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[1].transaction, Some(CommitTransaction::TransactionId(b"tx2".to_vec())));
}
