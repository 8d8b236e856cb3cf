//! Background execution of database commands.
//!
//! The import pipeline runs its DDL and stored-procedure calls off the
//! request path: [`JobRunner::start`] acquires a dedicated connection,
//! replaces whatever job the session had before, and spawns a worker
//! that reports its lifecycle through the session's progress log. Each
//! session holds at most one job; starting a new one supersedes the old
//! one rather than queueing behind it.
//!
//! Cancellation is cooperative. [`JobHandle::stop`] trips the job's
//! cancellation token and waits for the worker to wind down; the worker
//! then detaches its connection from the pool and closes it, so a
//! half-executed command never leaks back into the pool. The server may
//! still finish the statement on its side. Commands run without a
//! statement timeout, long procedures are expected.

use crate::import::error::ImportError;
use crate::import::progress::ProgressLog;
use crate::session::SessionContext;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::pool::PoolConnection;
use rocket_db_pools::sqlx::{self, Connection, PgPool, Postgres};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A value bound to one command parameter.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Text(String),
    Boolean(bool),
}

/// A named parameter. Names are informational: PostgreSQL binds
/// positionally, so parameters are passed in declaration order.
#[derive(Debug, Clone)]
pub struct CommandParameter {
    pub name: String,
    pub value: ParamValue,
}

impl CommandParameter {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One database command to run in the background: either a raw SQL
/// statement, or a stored procedure named by `text`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub text: String,
    pub stored_procedure: bool,
    pub parameters: Vec<CommandParameter>,
}

impl CommandSpec {
    pub fn statement(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stored_procedure: false,
            parameters: Vec::new(),
        }
    }

    pub fn procedure(name: impl Into<String>, parameters: Vec<CommandParameter>) -> Self {
        Self {
            text: name.into(),
            stored_procedure: true,
            parameters,
        }
    }

    /// Human-readable label used in progress messages.
    pub fn label(&self) -> String {
        if self.stored_procedure {
            format!("stored procedure \"{}\"", self.text)
        } else {
            "statement".to_string()
        }
    }

    /// The SQL actually sent to the server. Stored procedures become a
    /// `CALL` with one positional placeholder per parameter.
    fn sql(&self) -> String {
        if self.stored_procedure {
            build_call(&self.text, self.parameters.len())
        } else {
            self.text.clone()
        }
    }
}

fn build_call(procedure: &str, parameter_count: usize) -> String {
    let placeholders = (1..=parameter_count)
        .map(|position| format!("${}", position))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CALL \"{}\"({})", procedure.replace('"', "\"\""), placeholders)
}

/// Handle to one background job.
///
/// The `executing` flag is the job's externally visible state: `true`
/// from spawn until the worker has written its final progress message.
/// The worker stores `false` with release ordering only after that
/// message, and readers load the flag before draining, so a drain that
/// observes the job finished always includes the final message.
pub struct JobHandle {
    pub id: String,
    pub started_at: DateTime<Utc>,
    spec: CommandSpec,
    executing: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    pub fn is_running(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// Label of the underlying command, for log lines.
    pub fn label(&self) -> String {
        self.spec.label()
    }

    /// Wait for the worker to finish. Safe to call from several tasks;
    /// later callers block until the first await completes.
    pub async fn wait(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            let _ = handle.await;
        }
    }

    /// Request cancellation and wait for the worker to wind down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

/// Starts background commands on behalf of sessions.
pub struct JobRunner {
    pool: PgPool,
}

impl JobRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start `spec` as this session's job.
    ///
    /// The connection is acquired before any session state changes, so a
    /// database that is down fails the call without disturbing the prior
    /// job. On success the prior job (if any) is stopped and its leftover
    /// progress discarded, and the new job starts with a clean log.
    pub async fn start(
        &self,
        session: &SessionContext,
        spec: CommandSpec,
    ) -> Result<Arc<JobHandle>, ImportError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(ImportError::ConnectionFailure)?;

        let mut slot = session.job.lock().await;
        if let Some(prior) = slot.take() {
            log::info!(
                "session {}: superseding job {} ({})",
                session.id,
                prior.id,
                prior.label()
            );
            prior.stop().await;
        }
        session.progress.clear();

        let job_id = Uuid::new_v4().to_string();
        let executing = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        log::info!(
            "session {}: starting job {} ({})",
            session.id,
            job_id,
            spec.label()
        );

        let task = tokio::spawn(run_command(
            job_id.clone(),
            conn,
            spec.clone(),
            session.progress.clone(),
            executing.clone(),
            cancel.clone(),
        ));

        let handle = Arc::new(JobHandle {
            id: job_id,
            started_at: Utc::now(),
            spec,
            executing,
            cancel,
            task: Mutex::new(Some(task)),
        });
        *slot = Some(handle.clone());

        Ok(handle)
    }
}

async fn run_command(
    job_id: String,
    mut conn: PoolConnection<Postgres>,
    spec: CommandSpec,
    progress: Arc<ProgressLog>,
    executing: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let label = spec.label();
    let sql = spec.sql();
    progress.append(&format!("Executing {}.", label));

    let mut cancelled = false;
    let mut outcome = None;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            cancelled = true;
        }
        result = execute_command(&mut conn, &sql, &spec.parameters) => {
            outcome = Some(result);
        }
    }

    if cancelled {
        // The server may still be executing the statement; detaching and
        // closing keeps the interrupted connection out of the pool.
        let connection = conn.detach();
        if let Err(e) = connection.close().await {
            log::debug!("job {}: error closing cancelled connection: {}", job_id, e);
        }
        log::info!("job {}: cancelled", job_id);
        progress.append(&format!("Cancelled {}.", label));
    } else if let Some(result) = outcome {
        match result {
            Ok(rows_affected) => {
                log::info!("job {}: completed, {} rows affected", job_id, rows_affected);
                if spec.stored_procedure {
                    progress.append(&format!(
                        "Completed {} ({} rows affected).",
                        label, rows_affected
                    ));
                } else {
                    progress.append(&format!("Completed {}.", label));
                }
            }
            Err(e) => {
                log::warn!("job {}: failed: {}", job_id, e);
                progress.append(&format!("Failed {}: {}", label, e));
            }
        }
    }

    // Final message first, then the flag: a poll that sees the job
    // finished is guaranteed to drain the message above.
    executing.store(false, Ordering::Release);
}

async fn execute_command(
    conn: &mut PoolConnection<Postgres>,
    sql: &str,
    parameters: &[CommandParameter],
) -> Result<u64, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for parameter in parameters {
        query = match &parameter.value {
            ParamValue::Text(value) => query.bind(value.clone()),
            ParamValue::Boolean(value) => query.bind(*value),
        };
    }

    let result = query.execute(&mut **conn).await?;
    Ok(result.rows_affected())
}
