use serial_test::serial;
use tonic::{Code, Status};

use gcloud_spanner_core::apiv1::types::{Field, PartialResultSet, ResultSetStats, RowCount, Type, TypeCode};
use gcloud_spanner_core::reader::ReaderState;
use gcloud_spanner_core::row::{Error as RowError, Row, Struct, TryFromStruct};
use gcloud_spanner_core::statement::Statement;

mod common;
use common::*;

#[derive(Debug, PartialEq)]
struct Item {
    name: String,
    quantity: i64,
}

impl TryFromStruct for Item {
    fn try_from_struct(s: Struct<'_>) -> Result<Self, RowError> {
        Ok(Item {
            name: s.column_by_name("Name")?,
            quantity: s.column_by_name("Quantity")?,
        })
    }
}

fn item_type() -> Type {
    Type::struct_of(vec![
        Field::new("Name", Type::new(TypeCode::String)),
        Field::new("Quantity", Type::new(TypeCode::Int64)),
    ])
}

fn with_metadata(mut fragment: PartialResultSet, fields: Vec<Field>) -> PartialResultSet {
    fragment.metadata = metadata(fields);
    fragment
}

async fn collect(mock: &std::sync::Arc<MockSpanner>, sql: &str) -> Result<Vec<Row>, Status> {
    let client = new_client(mock, fixed_pool(1)).await;
    let tx = client.single().await.unwrap();
    let mut iter = tx.query(Statement::new(sql)).await?;
    let mut rows = vec![];
    while let Some(row) = iter.next().await? {
        rows.push(row);
    }
    assert_eq!(iter.state(), ReaderState::Drained);
    Ok(rows)
}

#[tokio::test]
#[serial]
async fn test_chunked_string_across_three_fragments() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Name", Type::new(TypeCode::String))];
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("he")], true, ""), fields)),
        Ok(fragment(vec![string_value("ll")], true, "")),
        Ok(fragment(vec![string_value("o"), string_value("world")], false, "")),
    ]);

    let rows = collect(&mock, "SELECT Name FROM Guild").await.unwrap();
    let names: Vec<String> = rows.iter().map(|r| r.column::<String>(0).unwrap()).collect();
    assert_eq!(names, vec!["hello".to_string(), "world".to_string()]);
}

#[tokio::test]
#[serial]
async fn test_array_of_struct_seam() {
    let mock = MockSpanner::new();
    let fields = vec![
        Field::new("Id", Type::new(TypeCode::Int64)),
        Field::new("Items", Type::array(item_type())),
    ];
    let first_items = list_value(vec![
        list_value(vec![string_value("apple"), string_value("1")]),
        list_value(vec![string_value("ba")]),
    ]);
    let second_items = list_value(vec![list_value(vec![string_value("nana"), string_value("2")])]);
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("10"), first_items], true, ""), fields)),
        Ok(fragment(vec![second_items, string_value("11"), list_value(vec![])], false, "")),
    ]);

    let rows = collect(&mock, "SELECT Id, Items FROM Inventory").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].column::<i64>(0).unwrap(), 10);
    let items = rows[0].column::<Vec<Item>>(1).unwrap();
    assert_eq!(
        items,
        vec![
            Item {
                name: "apple".to_string(),
                quantity: 1
            },
            Item {
                name: "banana".to_string(),
                quantity: 2
            }
        ]
    );
    assert_eq!(rows[1].column::<i64>(0).unwrap(), 11);
    assert!(rows[1].column::<Vec<Item>>(1).unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_resume_with_token() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::Int64))];
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("1")], false, "t1"), fields)),
        Ok(fragment(vec![string_value("2")], false, "")),
        Err(Status::unavailable("connection reset")),
    ]);
    mock.push_stream(vec![
        Ok(fragment(vec![string_value("2")], false, "t2")),
        Ok(fragment(vec![string_value("3")], false, "t3")),
    ]);

    let rows = collect(&mock, "SELECT Value FROM Numbers").await.unwrap();
    let values: Vec<i64> = rows.iter().map(|r| r.column::<i64>(0).unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);

    let calls = mock.calls_of("ExecuteStreamingSql");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].resume_token.is_empty());
    assert_eq!(calls[1].resume_token, b"t1".to_vec());

    // the resumed stream is another attempt of the same request
    let first: Vec<&str> = calls[0].request_id.split('.').collect();
    let second: Vec<&str> = calls[1].request_id.split('.').collect();
    assert_eq!(first[..5], second[..5]);
    assert_eq!(first[5], "1");
    assert_eq!(second[5], "2");
}

#[tokio::test]
#[serial]
async fn test_restart_without_token() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::Int64))];
    mock.push_stream(vec![Err(Status::unavailable("connection reset"))]);
    mock.push_stream(vec![Ok(with_metadata(fragment(vec![string_value("1")], false, ""), fields))]);

    let rows = collect(&mock, "SELECT Value FROM Numbers").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(mock.calls_of("ExecuteStreamingSql").len(), 2);
}

#[tokio::test]
#[serial]
async fn test_internal_error_is_fatal() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::Int64))];
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("1")], false, "t1"), fields)),
        Err(Status::internal("unexpected")),
    ]);

    let err = collect(&mock, "SELECT Value FROM Numbers").await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(mock.calls_of("ExecuteStreamingSql").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_retryable_internal_error() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::Int64))];
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("1")], false, "t1"), fields)),
        Err(Status::internal("Received unexpected EOS on DATA frame from server")),
    ]);
    mock.push_stream(vec![Ok(fragment(vec![string_value("2")], false, "t2"))]);

    let rows = collect(&mock, "SELECT Value FROM Numbers").await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_empty_result_set() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::String))];
    mock.push_stream(vec![Ok(with_metadata(fragment(vec![], false, ""), fields))]);

    let rows = collect(&mock, "SELECT Value FROM Empty").await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
#[serial]
async fn test_empty_string() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::String))];
    mock.push_stream(vec![Ok(with_metadata(
        fragment(vec![string_value(""), null_value()], false, ""),
        fields,
    ))]);

    let rows = collect(&mock, "SELECT Value FROM Strings").await.unwrap();
    assert_eq!(rows[0].column::<String>(0).unwrap(), "");
    assert_eq!(rows[1].column::<Option<String>>(0).unwrap(), None);
}

#[tokio::test]
#[serial]
async fn test_pending_chunk_at_end_of_stream() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::String))];
    mock.push_stream(vec![Ok(with_metadata(fragment(vec![string_value("he")], true, ""), fields))]);

    let err = collect(&mock, "SELECT Value FROM Strings").await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
#[serial]
async fn test_resource_exhausted_is_fatal() {
    let mock = MockSpanner::new();
    let fields = vec![Field::new("Value", Type::new(TypeCode::Int64))];
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("1")], false, "t1"), fields)),
        Err(Status::resource_exhausted("quota exceeded")),
    ]);
    mock.push_stream(vec![Ok(fragment(vec![string_value("2")], false, "t2"))]);

    let err = collect(&mock, "SELECT Value FROM Numbers").await.unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(mock.calls_of("ExecuteStreamingSql").len(), 1);
}

#[tokio::test]
#[serial]
async fn test_stats_and_column_metadata() {
    let mock = MockSpanner::new();
    let fields = vec![
        Field::new("Name", Type::new(TypeCode::String)),
        Field::new("Quantity", Type::new(TypeCode::Int64)),
    ];
    let mut last = fragment(vec![string_value("banana"), string_value("2")], false, "");
    last.stats = Some(ResultSetStats {
        query_stats: None,
        row_count: Some(RowCount::Exact(2)),
    });
    mock.push_stream(vec![
        Ok(with_metadata(fragment(vec![string_value("apple"), string_value("1")], false, ""), fields)),
        Ok(last),
    ]);

    let client = new_client(&mock, fixed_pool(1)).await;
    let tx = client.single().await.unwrap();
    let mut iter = tx.query(Statement::new("SELECT Name, Quantity FROM Items")).await.unwrap();
    let first = iter.next().await.unwrap().unwrap();
    assert_eq!(first.column_by_name::<String>("Name").unwrap(), "apple");

    let columns = iter.columns_metadata();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0].name, "Name");
    let (index, field) = iter.column_metadata("Quantity").unwrap();
    assert_eq!(index, 1);
    assert_eq!(field.r#type, Type::new(TypeCode::Int64));
    assert!(iter.column_metadata("Missing").is_none());

    while iter.next().await.unwrap().is_some() {}
    assert_eq!(iter.stats().unwrap().row_count, Some(RowCount::Exact(2)));
}
