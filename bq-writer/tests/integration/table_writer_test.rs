use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bq_config::TableDefinition;
use bq_telemetry::init_test_tracing;
use bq_writer::error::ErrorKind;
use bq_writer::test_utils::{column, scratch_dir, table_definition, write_file};
use bq_writer::split::Splitter;
use bq_writer::warehouse::memory::{MemoryWarehouse, Operation};
use bq_writer::writer::{PollSettings, TableWriter};
use bq_writer::writer_error;

const DATASET: &str = "writer_dataset";

fn writer(warehouse: &MemoryWarehouse, scratch: &Path) -> TableWriter<MemoryWarehouse> {
    TableWriter::new(Arc::new(warehouse.clone()), scratch)
        .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(2))
}

fn people_table() -> TableDefinition {
    table_definition(
        "in.c-main.people",
        "people",
        vec![column("id", "INTEGER"), column("name", "STRING")],
    )
}

fn quick_poll() -> PollSettings {
    PollSettings::new(1, 10)
}

/// Writes a people CSV of at least `min_bytes` and returns its path and data row count.
fn large_people_csv(dir: &Path, min_bytes: usize) -> (PathBuf, usize) {
    let mut contents = String::from("id,name\n");
    let mut rows = 0;
    while contents.len() < min_bytes {
        contents.push_str(&format!("{rows},\"person number {rows} with a longer name\"\n"));
        rows += 1;
    }

    (write_file(dir, "people.csv", &contents), rows)
}

#[tokio::test(start_paused = true)]
async fn full_load_replaces_table_contents() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let writer = writer(&warehouse, &dir);
    let table = people_table();

    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n2,bob\n3,carol\n");
    writer
        .write_sync(&csv, DATASET, &table, false, quick_poll())
        .await
        .unwrap();
    assert_eq!(warehouse.rows(DATASET, "people").await.unwrap().len(), 3);

    let csv = write_file(&dir, "people.csv", "id,name\n4,dave\n");
    writer
        .write_sync(&csv, DATASET, &table, false, quick_poll())
        .await
        .unwrap();

    assert_eq!(
        warehouse.rows(DATASET, "people").await.unwrap(),
        vec![vec!["4".to_owned(), "dave".to_owned()]]
    );
    assert_eq!(warehouse.calls(Operation::DeleteTable).await, 1);
    assert_eq!(warehouse.calls(Operation::CreateDataset).await, 1);

    let loads = warehouse.loads().await;
    assert!(loads.iter().all(|load| load.skip_leading_rows == 1));
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn incremental_load_appends_rows() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let writer = writer(&warehouse, &dir);
    let table = people_table();

    for _ in 0..2 {
        let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n2,bob\n");
        writer
            .write_sync(&csv, DATASET, &table, true, quick_poll())
            .await
            .unwrap();
    }

    assert_eq!(warehouse.rows(DATASET, "people").await.unwrap().len(), 4);
    assert_eq!(warehouse.calls(Operation::DeleteTable).await, 0);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn large_file_is_loaded_in_chunks() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let writer = writer(&warehouse, &dir);
    let mut table = people_table();
    table.chunk_size = Some(1);

    let (csv, rows) = large_people_csv(&dir, 5 * 1024 * 1024 / 2);
    let size = std::fs::metadata(&csv).unwrap().len();
    let expected_chunks = size.div_ceil(1024 * 1024) as usize;

    writer
        .write_sync(&csv, DATASET, &table, false, quick_poll())
        .await
        .unwrap();

    let loads = warehouse.loads().await;
    assert_eq!(loads.len(), expected_chunks);
    assert!(loads.iter().all(|load| load.skip_leading_rows == 0));
    assert!(loads.iter().all(|load| !load.path.exists()));
    assert!(!csv.exists());

    let loaded = warehouse.rows(DATASET, "people").await.unwrap();
    assert_eq!(loaded.len(), rows);
    assert!(!loaded.iter().any(|row| row[0] == "id"));

    let leftovers = std::fs::read_dir(&dir).unwrap().count();
    assert_eq!(leftovers, 0, "scratch directories must be removed");
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn chunk_uploads_are_bounded() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    warehouse.set_load_latency(Duration::from_secs(5)).await;
    let writer = writer(&warehouse, &dir).with_max_concurrent_uploads(2);
    let mut table = people_table();
    table.chunk_size = Some(1);
    let (csv, rows) = large_people_csv(&dir, 9 * 1024 * 1024 / 2);

    writer
        .write_sync(&csv, DATASET, &table, false, quick_poll())
        .await
        .unwrap();

    assert_eq!(warehouse.loads().await.len(), 5);
    assert_eq!(warehouse.peak_loads_in_flight().await, 2);
    assert_eq!(warehouse.rows(DATASET, "people").await.unwrap().len(), rows);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_split_aborts_the_load() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let writer = writer(&warehouse, &dir).with_splitter(Splitter::new("false"));
    let mut table = people_table();
    table.chunk_size = Some(1);
    let (csv, _) = large_people_csv(&dir, 3 * 1024 * 1024 / 2);

    let err = writer
        .write_sync(&csv, DATASET, &table, false, quick_poll())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SplitFailed);
    assert!(
        err.message().starts_with("Table writer_dataset.people: "),
        "{}",
        err.message()
    );
    assert_eq!(warehouse.calls(Operation::SubmitLoad).await, 0);
    assert!(csv.exists());
    let entries = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect::<Vec<_>>();
    assert_eq!(entries, vec![std::ffi::OsString::from("people.csv")]);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn unfinished_job_times_out() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    warehouse.set_polls_until_done(None).await;
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");

    let err = writer(&warehouse, &dir)
        .write_sync(&csv, DATASET, &people_table(), false, PollSettings::new(2, 3))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadJobTimeout);
    assert!(err.message().contains("6 seconds"), "{}", err.message());
    assert!(err.message().contains("writer_dataset.people"), "{}", err.message());
    assert_eq!(warehouse.calls(Operation::RefreshJob).await, 3);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn rejected_rows_fail_with_job_diagnostic() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n2,bob,extra\n");

    let err = writer(&warehouse, &dir)
        .write_sync(&csv, DATASET, &people_table(), false, quick_poll())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LoadJobFailed);
    assert!(err.is_user_error());
    assert!(err.message().contains("Too many values in line"), "{}", err.message());
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn invalid_dataset_name_is_reported() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");

    let err = writer(&warehouse, &dir)
        .write(&csv, "my-dataset", &people_table(), false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationInvalidRequest);
    assert!(err.is_user_error());
    assert!(err.message().contains("Invalid dataset ID"), "{}", err.message());
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    warehouse.set_polls_until_done(Some(0)).await;
    for operation in [Operation::CreateTable, Operation::SubmitLoad] {
        warehouse
            .fail_next(
                operation,
                writer_error!(ErrorKind::DestinationUnavailable, "BigQuery is unavailable"),
            )
            .await;
    }
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");

    writer(&warehouse, &dir)
        .write_sync(&csv, DATASET, &people_table(), false, quick_poll())
        .await
        .unwrap();

    assert_eq!(warehouse.calls(Operation::CreateTable).await, 2);
    assert_eq!(warehouse.calls(Operation::SubmitLoad).await, 2);
    assert_eq!(warehouse.rows(DATASET, "people").await.unwrap().len(), 1);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn permission_errors_are_not_retried() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    warehouse
        .fail_next(
            Operation::GetDataset,
            writer_error!(
                ErrorKind::DestinationPermissionDenied,
                "BigQuery denied access",
                "Access Denied: Dataset project:writer_dataset"
            ),
        )
        .await;
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");

    let err = writer(&warehouse, &dir)
        .write(&csv, DATASET, &people_table(), false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationPermissionDenied);
    assert_eq!(
        err.message(),
        "Table writer_dataset.people: Access Denied: Dataset project:writer_dataset"
    );
    assert_eq!(warehouse.calls(Operation::GetDataset).await, 1);
    std::fs::remove_dir_all(dir).unwrap();
}

#[tokio::test]
async fn table_without_columns_fails_before_any_call() {
    init_test_tracing();
    let dir = scratch_dir("table-writer");
    let warehouse = MemoryWarehouse::new("project");
    let mut table = people_table();
    table.items = None;
    let csv = write_file(&dir, "people.csv", "id,name\n1,alice\n");

    let err = writer(&warehouse, &dir)
        .write(&csv, DATASET, &table, false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaError);
    assert_eq!(warehouse.calls(Operation::ListProjects).await, 0);
    std::fs::remove_dir_all(dir).unwrap();
}
