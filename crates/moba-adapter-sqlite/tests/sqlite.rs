use moba_adapter_sqlite::{SqliteDatabase, SqliteOptions};
use moba_core::Database;
use serde_json::{Value, json};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Executor};
use std::path::PathBuf;
use tempfile::TempDir;

async fn sample_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.db");
    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    conn.execute(
        r#"
        CREATE TABLE customers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT
        );
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            total REAL,
            note BLOB
        );
        INSERT INTO customers (id, name, email) VALUES
            (1, 'Ada', 'ada@example.com'),
            (2, 'Grace', NULL),
            (3, 'Edsger', 'ed@example.com');
        INSERT INTO orders (id, customer_id, total, note) VALUES
            (10, 1, 19.5, X'6869'),
            (11, 2, 5.0, NULL);
        "#,
    )
    .await
    .unwrap();
    (dir, path)
}

#[tokio::test]
async fn test_list_tables_excludes_internal() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();
    assert_eq!(db.list_tables().await.unwrap(), vec!["customers", "orders"]);
}

#[tokio::test]
async fn test_describe_table() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let info = db.describe_table("customers").await.unwrap();
    assert_eq!(info.name, "customers");
    assert_eq!(info.columns.len(), 3);
    assert!(info.columns[0].primary_key);
    assert_eq!(info.columns[1].data_type, "TEXT");
    assert!(!info.columns[1].nullable);
    assert!(info.columns[2].nullable);

    let err = db.describe_table("nope").await.unwrap_err();
    assert_eq!(err.classification(), "TableNotFound");
}

#[tokio::test]
async fn test_execute_maps_storage_classes() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let rows = db
        .execute("SELECT id, total, note FROM orders ORDER BY id", &[], 100)
        .await
        .unwrap();
    assert_eq!(rows.columns, vec!["id", "total", "note"]);
    assert_eq!(rows.rows[0]["id"], json!(10));
    assert_eq!(rows.rows[0]["total"], json!(19.5));
    assert_eq!(rows.rows[0]["note"], json!("hi"));
    assert_eq!(rows.rows[1]["note"], Value::Null);
    assert!(!rows.truncated);
}

#[tokio::test]
async fn test_execute_binds_positional_params() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let rows = db
        .execute(
            "SELECT name FROM customers WHERE id > ? AND name <> ?",
            &[json!(1), json!("Grace")],
            100,
        )
        .await
        .unwrap();
    assert_eq!(rows.row_count(), 1);
    assert_eq!(rows.rows[0]["name"], "Edsger");

    let err = db
        .execute("SELECT ?", &[json!({"a": 1})], 100)
        .await
        .unwrap_err();
    assert_eq!(err.classification(), "InvalidParameter");
}

#[tokio::test]
async fn test_execute_truncates_at_limit() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let rows = db
        .execute("SELECT id FROM customers ORDER BY id", &[], 2)
        .await
        .unwrap();
    assert_eq!(rows.row_count(), 2);
    assert!(rows.truncated);
}

#[tokio::test]
async fn test_empty_result_keeps_columns() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let rows = db
        .execute("SELECT id, name FROM customers WHERE id < 0", &[], 10)
        .await
        .unwrap();
    assert!(rows.rows.is_empty());
    assert_eq!(rows.columns, vec!["id", "name"]);
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();

    let err = db
        .execute("DELETE FROM customers", &[], 10)
        .await
        .unwrap_err();
    assert_eq!(err.classification(), "QueryFailed");
}

#[tokio::test]
async fn test_invalid_sql_is_query_failure() {
    let (_dir, path) = sample_db().await;
    let db = SqliteDatabase::open(&path, SqliteOptions::default()).await.unwrap();
    let err = db.execute("SELEC nothing", &[], 10).await.unwrap_err();
    assert_eq!(err.classification(), "QueryFailed");
}
