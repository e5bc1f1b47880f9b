//! PgWriter against a live PostgreSQL server.
//!
//! Set `STASH_PG_TEST_URL` to a superuser connection string (the session
//! switches `session_replication_role`) and run with `--ignored`.

use chrono::{TimeZone, Utc};
use stash_pg_migrate::{Batch, MigrateError, PgWriter, SqlValue, TargetConfig, TargetWriter};
use tokio_postgres::{Client, NoTls};

const URL_VAR: &str = "STASH_PG_TEST_URL";

fn test_url() -> Option<String> {
    let url = std::env::var(URL_VAR).ok();
    if url.is_none() {
        eprintln!("{} not set, skipping", URL_VAR);
    }
    url
}

async fn admin(url: &str, setup: &str) -> Client {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client.batch_execute(setup).await.unwrap();
    client
}

async fn writer(url: &str) -> PgWriter {
    let config = TargetConfig {
        url: url.to_string(),
        ..Default::default()
    };
    PgWriter::connect(&config).await.unwrap()
}

async fn count(client: &Client, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .await
        .unwrap()
        .get(0)
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_batch_encoding_and_sequence_reset() {
    let Some(url) = test_url() else { return };
    let client = admin(
        &url,
        "DROP TABLE IF EXISTS spm_enc_tags, spm_enc_empty, spm_enc_plain;
         CREATE TABLE spm_enc_tags (
             id serial PRIMARY KEY,
             name text NOT NULL,
             favorite boolean NOT NULL,
             rating double precision,
             find_filter jsonb,
             created_at timestamptz,
             cover bytea
         );
         CREATE TABLE spm_enc_empty (id serial PRIMARY KEY);
         CREATE TABLE spm_enc_plain (id integer PRIMARY KEY);",
    )
    .await;
    let target = writer(&url).await;

    let created = Utc.with_ymd_and_hms(2023, 5, 6, 7, 8, 9).unwrap();
    let rows = [3i64, 7, 12]
        .iter()
        .map(|id| {
            vec![
                SqlValue::I64(*id),
                SqlValue::Text(format!("tag {}", id)),
                SqlValue::I64(1),
                SqlValue::I64(4),
                SqlValue::from("{\"sort\":\"title\"}"),
                SqlValue::Timestamp(created),
                SqlValue::Bytes(vec![0xff, 0xd8]),
            ]
        })
        .collect();
    let batch = Batch::new(
        columns(&["id", "name", "favorite", "rating", "find_filter", "created_at", "cover"]),
        rows,
    );

    assert_eq!(target.write_batch("spm_enc_tags", &batch).await.unwrap(), 3);

    let row = client
        .query_one(
            "SELECT favorite, rating, find_filter, created_at, cover FROM spm_enc_tags WHERE id = 7",
            &[],
        )
        .await
        .unwrap();
    assert!(row.get::<_, bool>(0));
    assert_eq!(row.get::<_, f64>(1), 4.0);
    assert_eq!(row.get::<_, serde_json::Value>(2)["sort"], "title");
    assert_eq!(row.get::<_, chrono::DateTime<Utc>>(3), created);
    assert_eq!(row.get::<_, Vec<u8>>(4), vec![0xff, 0xd8]);

    let values = target
        .reset_sequences(&["spm_enc_tags", "spm_enc_plain", "spm_enc_empty"])
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![
            ("spm_enc_tags".to_string(), 13),
            ("spm_enc_empty".to_string(), 1)
        ]
    );

    let next: i32 = client
        .query_one(
            "INSERT INTO spm_enc_tags (name, favorite) VALUES ('new', false) RETURNING id",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(next, 13);

    target.close().await.unwrap();
    client
        .batch_execute("DROP TABLE spm_enc_tags, spm_enc_empty, spm_enc_plain")
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_large_batch_splits_inside_one_transaction() {
    let Some(url) = test_url() else { return };
    let client = admin(
        &url,
        "DROP TABLE IF EXISTS spm_split_files;
         CREATE TABLE spm_split_files (id integer PRIMARY KEY, size bigint, basename text);",
    )
    .await;
    let target = writer(&url).await;
    let cols = columns(&["id", "size", "basename"]);

    // 30 000 rows x 3 columns exceeds the bind-parameter limit.
    let rows: Vec<Vec<SqlValue>> = (1..=30_000i64)
        .map(|id| vec![SqlValue::I64(id), SqlValue::I64(id * 10), SqlValue::Text(format!("f{}.mp4", id))])
        .collect();
    let batch = Batch::new(cols.clone(), rows.clone());
    assert_eq!(target.write_batch("spm_split_files", &batch).await.unwrap(), 30_000);
    assert_eq!(count(&client, "spm_split_files").await, 30_000);

    // A duplicate in the last statement rolls back the earlier ones too.
    client.batch_execute("TRUNCATE spm_split_files").await.unwrap();
    let mut failing = rows;
    failing.push(vec![SqlValue::I64(1), SqlValue::I64(0), SqlValue::from("dup.mp4")]);
    let err = target
        .write_batch("spm_split_files", &Batch::new(cols, failing))
        .await
        .unwrap_err();

    match err {
        MigrateError::Statement { table, message, .. } => {
            assert_eq!(table, "spm_split_files");
            assert!(message.starts_with("23505"), "{}", message);
        }
        other => panic!("expected a statement error, got {:?}", other),
    }
    assert_eq!(count(&client, "spm_split_files").await, 0);

    target.close().await.unwrap();
    client.batch_execute("DROP TABLE spm_split_files").await.unwrap();
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_each_batch_commits_on_its_own() {
    let Some(url) = test_url() else { return };
    let client = admin(
        &url,
        "DROP TABLE IF EXISTS spm_commit_markers;
         CREATE TABLE spm_commit_markers (id serial PRIMARY KEY, title text NOT NULL);",
    )
    .await;
    let target = writer(&url).await;
    let cols = columns(&["id", "title"]);

    let first = Batch::new(cols.clone(), vec![vec![SqlValue::I64(1), SqlValue::from("intro")]]);
    target.write_batch("spm_commit_markers", &first).await.unwrap();

    let second = Batch::new(
        cols,
        vec![
            vec![SqlValue::I64(2), SqlValue::from("outro")],
            vec![SqlValue::I64(3), SqlValue::Null],
        ],
    );
    assert!(target.write_batch("spm_commit_markers", &second).await.is_err());

    assert_eq!(count(&client, "spm_commit_markers").await, 1);
    assert_eq!(target.get_row_count("spm_commit_markers").await.unwrap(), 1);

    target.close().await.unwrap();
    client.batch_execute("DROP TABLE spm_commit_markers").await.unwrap();
}
