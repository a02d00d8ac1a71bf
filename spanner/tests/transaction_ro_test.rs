use std::time::Duration;

use serial_test::serial;
use tonic::{Code, Status};

use gcloud_spanner_core::apiv1::types::transaction_selector::Selector;
use gcloud_spanner_core::client::{Error, ReadOnlyTransactionOption};
use gcloud_spanner_core::statement::Statement;
use gcloud_spanner_core::transaction_ro::ReadOnlyTransaction;
use gcloud_spanner_core::value::TimestampBound;

mod common;
use common::*;

async fn read_values(tx: &ReadOnlyTransaction, sql: &str) -> Result<Vec<i64>, Status> {
    let mut iter = tx.query(Statement::new(sql)).await?;
    let mut values = vec![];
    while let Some(row) = iter.next().await? {
        values.push(row.column::<i64>(0).map_err(|e| Status::internal(e.to_string()))?);
    }
    Ok(values)
}

#[tokio::test]
#[serial]
async fn test_single_use() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let tx = client.single().await.unwrap();
    assert_eq!(read_values(&tx, "SELECT 1").await.unwrap(), vec![1]);

    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0].selector, Some(Selector::SingleUse(_))));
    assert_eq!(calls[0].seqno, 0);
    assert!(!calls[0].route_to_leader);
}

#[tokio::test]
#[serial]
async fn test_single_use_bounded_staleness() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let tx = client
        .single_with_timestamp_bound(TimestampBound::max_staleness(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(read_values(&tx, "SELECT 1").await.unwrap(), vec![1]);
}

#[tokio::test]
#[serial]
async fn test_bounded_staleness_rejected_in_multi_use() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let option = ReadOnlyTransactionOption {
        timestamp_bound: TimestampBound::max_staleness(Duration::from_secs(10)),
        ..Default::default()
    };
    match client.read_only_transaction_with_option(option).await {
        Err(Error::GRPC(status)) => assert_eq!(status.code(), Code::InvalidArgument),
        _ => panic!("bounded staleness must be rejected"),
    }
    assert!(mock.calls_of("BeginTransaction").is_empty());
    assert_eq!(client.session_pool_stats().num_inuse, 0);
}

#[tokio::test]
#[serial]
async fn test_inline_begin() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let tx = client.read_only_transaction().await.unwrap();
    assert!(tx.read_timestamp().is_none());
    read_values(&tx, "SELECT 1").await.unwrap();
    read_values(&tx, "SELECT 1").await.unwrap();
    assert!(tx.read_timestamp().is_some());

    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_begin());
    assert_eq!(calls[1].selector, Some(Selector::Id(b"tx1".to_vec())));
    assert!(mock.calls_of("BeginTransaction").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_concurrent_first_reads_begin_once() {
    let mock = MockSpanner::new();
    *mock.fragment_delay.lock() = Some(Duration::from_millis(50));
    let client = new_client(&mock, fixed_pool(1)).await;

    let tx = client.read_only_transaction().await.unwrap();
    let (first, second) = tokio::join!(read_values(&tx, "SELECT 1"), read_values(&tx, "SELECT 1"));
    assert_eq!(first.unwrap(), vec![1]);
    assert_eq!(second.unwrap(), vec![1]);

    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls.iter().filter(|c| c.is_begin()).count(), 1);
    assert_eq!(
        calls.iter().filter(|c| c.selector == Some(Selector::Id(b"tx1".to_vec()))).count(),
        1
    );
    // the waiting read is sent only after the id arrived
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_millis(50));
}

#[tokio::test]
#[serial]
async fn test_failed_inline_begin_releases_waiters() {
    let mock = MockSpanner::new();
    mock.push_stream(vec![Err(Status::invalid_argument("syntax error"))]);
    let client = new_client(&mock, fixed_pool(1)).await;

    let tx = client.read_only_transaction().await.unwrap();
    let err = read_values(&tx, "SELEC 1").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // nothing began, so the next read begins again
    read_values(&tx, "SELECT 1").await.unwrap();
    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.is_begin()));
}

#[tokio::test]
#[serial]
async fn test_explicit_begin() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    let option = ReadOnlyTransactionOption {
        explicit_begin: true,
        ..Default::default()
    };
    let tx = client.read_only_transaction_with_option(option).await.unwrap();
    assert!(tx.read_timestamp().is_some());
    read_values(&tx, "SELECT 1").await.unwrap();

    assert_eq!(mock.calls_of("BeginTransaction").len(), 1);
    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls[0].selector, Some(Selector::Id(b"tx1".to_vec())));
}

#[tokio::test]
#[serial]
async fn test_read_releases_session() {
    let mock = MockSpanner::new();
    let client = new_client(&mock, fixed_pool(1)).await;

    {
        let tx = client.single().await.unwrap();
        assert_eq!(client.session_pool_stats().num_inuse, 1);
        read_values(&tx, "SELECT 1").await.unwrap();
    }
    assert_eq!(client.session_pool_stats().num_inuse, 0);
    let tx = client.single().await.unwrap();
    read_values(&tx, "SELECT 1").await.unwrap();
    assert_eq!(mock.sessions_created(), 1);
}
