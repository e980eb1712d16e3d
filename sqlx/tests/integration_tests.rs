//! Integration tests for `SqlxConnectionProvider` using testcontainers.
//!
//! These run the full bus against a real `PostgreSQL` database.
//!
//! # Requirements
//!
//! Docker must be running. The tests are ignored by default; run them with
//! `cargo test -p querybus-sqlx -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code uses expect for clear failure messages

use querybus_core::{BindValue, BusError, ExecutionError};
use querybus_runtime::retry::RetryPolicy;
use querybus_runtime::{BusConfig, QueryBus};
use querybus_sqlx::{DatabaseConfig, Driver, SqlxConnectionProvider, decode_row};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

const BUDGET: Duration = Duration::from_secs(5);

/// Start a Postgres container and connect a provider to it.
///
/// Returns the container too, so it lives as long as the test.
async fn setup() -> (ContainerAsync<Postgres>, QueryBus<SqlxConnectionProvider>) {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start postgres container");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get postgres port");

    let config = DatabaseConfig {
        driver: Driver::Postgres,
        database: "postgres".to_string(),
        user: "postgres".to_string(),
        password: "postgres".to_string(),
        host: "127.0.0.1".to_string(),
        port,
        max_open_connections: 4,
        max_idle_connections: 1,
        connect_retry: RetryPolicy::builder()
            .max_retries(30)
            .initial_delay(Duration::from_millis(500))
            .max_delay(Duration::from_secs(2))
            .build(),
        ..DatabaseConfig::default()
    };
    let provider = SqlxConnectionProvider::connect(&config)
        .await
        .expect("Failed to connect to postgres");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT
        )
        ",
    )
    .execute(provider.pool())
    .await
    .expect("Failed to create users table");

    let bus = QueryBus::start(provider, BusConfig::default().with_pool_size(4))
        .expect("Failed to start bus");
    (container, bus)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mutation_then_read() {
    let (_container, bus) = setup().await;

    let summary = bus
        .submit_sharded_mutation(
            "kim@example.com",
            "INSERT INTO users (email, name) VALUES ($1, $2)",
            vec!["kim@example.com".into(), "Kim".into()],
            BUDGET,
        )
        .await
        .expect("Insert should succeed");
    assert_eq!(summary.rows_affected, 1);

    let row = bus
        .submit_read_with_args(
            "SELECT email, name FROM users WHERE email = $1",
            vec!["kim@example.com".into()],
            BUDGET,
        )
        .await
        .expect("Read should succeed")
        .first()
        .await
        .expect("Row should decode")
        .expect("Row should exist");

    assert_eq!(
        decode_row(&row).unwrap(),
        vec![
            BindValue::Text("kim@example.com".to_string()),
            BindValue::Text("Kim".to_string()),
        ]
    );

    bus.shutdown(BUDGET).await.expect("Shutdown should drain");
    bus.provider().close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_read_is_empty_cursor() {
    let (_container, bus) = setup().await;

    let mut cursor = bus
        .submit_read_with_args(
            "SELECT id FROM users WHERE email = $1",
            vec!["nobody@example.com".into()],
            BUDGET,
        )
        .await
        .expect("Empty read is not an error");

    assert!(cursor.next().await.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unique_violation_is_rejected_with_code() {
    let (_container, bus) = setup().await;
    let insert = "INSERT INTO users (email) VALUES ($1)";

    bus.submit_mutation(insert, vec!["dup@example.com".into()], BUDGET)
        .await
        .expect("First insert should succeed");
    let err = bus
        .submit_mutation(insert, vec!["dup@example.com".into()], BUDGET)
        .await
        .unwrap_err();

    match err {
        BusError::Execution(ExecutionError::Rejected { code, .. }) => {
            assert_eq!(code.as_deref(), Some("23505"));
        }
        other => panic!("expected unique violation, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_bad_statement_surfaces_before_first_row() {
    let (_container, bus) = setup().await;

    let err = bus
        .submit_read("SELECT * FROM no_such_table", BUDGET)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Execution(ExecutionError::Rejected { .. })
    ));

    // The bus keeps serving after the failure.
    let rows = bus
        .submit_read("SELECT 1", BUDGET)
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_large_result_streams_and_releases_connection() {
    let (_container, bus) = setup().await;

    for i in 0..200 {
        bus.submit_mutation(
            "INSERT INTO users (email) VALUES ($1)",
            vec![format!("user{i}@example.com").into()],
            BUDGET,
        )
        .await
        .unwrap();
    }

    // Abandon several partially read cursors; each must give its
    // connection back or the pool of four would run dry.
    for _ in 0..8 {
        let mut cursor = bus.submit_read("SELECT email FROM users", BUDGET).await.unwrap();
        assert!(cursor.next().await.is_some());
        cursor.close();
    }

    let all = bus
        .submit_read("SELECT email FROM users ORDER BY id", BUDGET)
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(all.len(), 200);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_null_binds_as_text() {
    let (_container, bus) = setup().await;
    sqlx::query("CREATE TABLE scores (email TEXT NOT NULL, points BIGINT)")
        .execute(bus.provider().pool())
        .await
        .expect("Failed to create scores table");

    // Untyped NULL into a BIGINT column is refused by the server.
    let err = bus
        .submit_mutation(
            "INSERT INTO scores (email, points) VALUES ($1, $2)",
            vec!["kim@example.com".into(), BindValue::Null],
            BUDGET,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::Execution(ExecutionError::Rejected { .. })
    ));

    // A cast in the statement makes it land as a BIGINT NULL.
    bus.submit_mutation(
        "INSERT INTO scores (email, points) VALUES ($1, $2::BIGINT)",
        vec!["kim@example.com".into(), BindValue::Null],
        BUDGET,
    )
    .await
    .expect("Cast NULL should insert");

    // Text columns take it as is.
    bus.submit_mutation(
        "UPDATE users SET name = $1 WHERE email = $2",
        vec![BindValue::Null, "nobody@example.com".into()],
        BUDGET,
    )
    .await
    .expect("Text NULL should bind");

    let row = bus
        .submit_read_with_args(
            "SELECT points FROM scores WHERE email = $1",
            vec!["kim@example.com".into()],
            BUDGET,
        )
        .await
        .unwrap()
        .first()
        .await
        .unwrap()
        .expect("Row should exist");
    assert_eq!(decode_row(&row).unwrap(), vec![BindValue::Null]);
}

#[tokio::test]
async fn test_unreachable_database_fails_startup() {
    let config = DatabaseConfig {
        driver: Driver::Postgres,
        host: "127.0.0.1".to_string(),
        port: 1,
        acquire_timeout: Duration::from_millis(200),
        connect_retry: RetryPolicy::no_retry(),
        ..DatabaseConfig::default()
    };

    let err = SqlxConnectionProvider::connect(&config).await.unwrap_err();
    assert!(matches!(err, querybus_core::StartupError::Connect(_)));
}
