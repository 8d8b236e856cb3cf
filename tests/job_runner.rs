use import_server::import::runner::{CommandSpec, JobRunner};
use import_server::session::SessionRegistry;
use import_server::test_support::{TestDatabase, TestDatabaseError};
use std::time::Duration;

/// Start a disposable Postgres container, or skip the test when no
/// container runtime is available on the host.
async fn provision_database() -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping job runner test: could not start postgres container: {err}");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

#[tokio::test]
async fn starting_a_second_job_replaces_the_first() {
    let Some(test_db) = provision_database().await else {
        return;
    };
    let runner = JobRunner::new(test_db.pool_clone());
    let registry = SessionRegistry::new();
    let session = registry.context("replace");

    let first = runner
        .start(&session, CommandSpec::statement("SELECT pg_sleep(30)"))
        .await
        .expect("first job starts");
    assert!(first.is_running());

    // A session with a live job is never expired, however long idle.
    assert!(registry.remove_expired(Duration::ZERO).is_empty());

    let second = runner
        .start(&session, CommandSpec::statement("SELECT 1"))
        .await
        .expect("second job starts");

    // Replaced, not queued: the long statement is stopped right away.
    assert!(!first.is_running());
    second.wait().await;
    assert!(!second.is_running());

    // The new job starts with a clean log, so nothing from the
    // superseded statement survives.
    let joined = session.progress.drain().join(" | ");
    assert!(
        joined.contains("Completed statement."),
        "unexpected progress lines: {joined}"
    );
    assert!(
        !joined.contains("Cancelled"),
        "unexpected progress lines: {joined}"
    );

    assert!(session.job.lock().await.is_some());

    // With the job finished the session is free to expire again.
    assert_eq!(registry.remove_expired(Duration::ZERO).len(), 1);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn failed_statement_reports_through_progress() {
    let Some(test_db) = provision_database().await else {
        return;
    };
    let runner = JobRunner::new(test_db.pool_clone());
    let registry = SessionRegistry::new();
    let session = registry.context("failure");

    let handle = runner
        .start(
            &session,
            CommandSpec::statement("SELECT * FROM no_such_table"),
        )
        .await
        .expect("job starts");
    handle.wait().await;
    assert!(!handle.is_running());

    let joined = session.progress.drain().join(" | ");
    assert!(
        joined.contains("Failed statement:"),
        "unexpected progress lines: {joined}"
    );

    test_db.close().await.expect("failed to drop test database");
}
