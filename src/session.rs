//! Per-session import state.
//!
//! Every request carries an `X-Import-Session` header chosen by the
//! client. The header value keys into a registry of session contexts,
//! each holding the most recent upload, the progress log, and at most
//! one background job. Two clients with different session ids never see
//! each other's uploads or progress.

use crate::import::progress::ProgressLog;
use crate::import::runner::JobHandle;
use dashmap::DashMap;
use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::State;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{Object, Parameter, ParameterValue};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Name of the header that scopes import state to one client.
pub const SESSION_HEADER: &str = "X-Import-Session";

const MAX_SESSION_ID_LENGTH: usize = 128;

/// How long a session may sit untouched before the sweeper discards it.
pub const SESSION_TTL: Duration = Duration::from_secs(20 * 60);

/// How often the sweeper scans for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A spreadsheet that has been received and saved but not yet imported.
#[derive(Debug, Clone)]
pub struct UploadedSpreadsheet {
    /// Original file name as supplied by the client.
    pub file_name: String,
    /// Where the upload was saved on disk.
    pub path: PathBuf,
}

/// State owned by one import session.
pub struct SessionContext {
    pub id: String,
    /// Random tag embedded in this session's staged file names. Ids can
    /// sanitize to the same file-name prefix; the tag keeps the staged
    /// files of such sessions apart.
    pub disk_tag: String,
    pub progress: Arc<ProgressLog>,
    /// The one background job this session may have in flight.
    pub job: tokio::sync::Mutex<Option<Arc<JobHandle>>>,
    /// Most recent accepted upload, replaced by each new upload.
    pub upload: parking_lot::Mutex<Option<UploadedSpreadsheet>>,
    last_touched: parking_lot::Mutex<Instant>,
}

impl SessionContext {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            disk_tag: Uuid::new_v4().simple().to_string(),
            progress: Arc::new(ProgressLog::new()),
            job: tokio::sync::Mutex::new(None),
            upload: parking_lot::Mutex::new(None),
            last_touched: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Replace the remembered upload, returning the one it displaces.
    pub fn replace_upload(&self, upload: UploadedSpreadsheet) -> Option<UploadedSpreadsheet> {
        self.upload.lock().replace(upload)
    }

    pub fn current_upload(&self) -> Option<UploadedSpreadsheet> {
        self.upload.lock().clone()
    }

    fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_touched.lock().elapsed()
    }

    /// Whether the session is in use right now: a request holds the job
    /// slot, or a background job is still executing.
    fn is_busy(&self) -> bool {
        match self.job.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(|handle| handle.is_running()),
            Err(_) => true,
        }
    }
}

/// Registry of live session contexts keyed by session id. Clones are
/// handles to the same underlying map.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<SessionContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the context for `id`, creating it on first use. Fetching
    /// also marks the session as recently used.
    pub fn context(&self, id: &str) -> Arc<SessionContext> {
        let context = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(SessionContext::new(id)))
            .value()
            .clone();
        context.touch();
        context
    }

    /// Remove every session left untouched for at least `ttl`, returning
    /// the removed contexts so their staged uploads can be cleaned up.
    /// A session whose job slot is held or still running is kept
    /// regardless of idle time.
    pub fn remove_expired(&self, ttl: Duration) -> Vec<Arc<SessionContext>> {
        let mut expired = Vec::new();
        self.sessions.retain(|_, context| {
            if context.idle_for() < ttl || context.is_busy() {
                return true;
            }
            expired.push(context.clone());
            false
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Background task that expires idle sessions.
///
/// Session ids are client-chosen and never explicitly released, so
/// without expiry every distinct id would pin a context, and possibly a
/// staged file on disk, for the life of the process.
pub struct SessionSweeper {
    registry: SessionRegistry,
}

impl SessionSweeper {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Run the sweep loop forever.
    pub async fn run(self) -> ! {
        log::info!(
            "session sweeper started: discarding sessions idle for {}s",
            SESSION_TTL.as_secs()
        );
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            for context in self.registry.remove_expired(SESSION_TTL) {
                release_session(&context).await;
            }
        }
    }
}

/// Discard an expired session's on-disk state.
async fn release_session(context: &SessionContext) {
    log::info!("session {}: expired, discarding session state", context.id);
    if let Some(upload) = context.current_upload() {
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            log::debug!(
                "could not delete staged upload '{}': {}",
                upload.path.display(),
                e
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing {SESSION_HEADER} header")]
    MissingHeader,
    #[error("invalid {SESSION_HEADER} header: {0}")]
    InvalidHeader(String),
    #[error("session registry not initialized")]
    RegistryUnavailable,
}

impl SessionError {
    pub fn status(&self) -> Status {
        match self {
            SessionError::MissingHeader | SessionError::InvalidHeader(_) => Status::BadRequest,
            SessionError::RegistryUnavailable => Status::InternalServerError,
        }
    }
}

/// Request guard resolving the caller's session context from the
/// `X-Import-Session` header.
pub struct ImportSession(pub Arc<SessionContext>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ImportSession {
    type Error = SessionError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(raw) = request.headers().get_one(SESSION_HEADER) else {
            let err = SessionError::MissingHeader;
            return Outcome::Error((err.status(), err));
        };

        let id = raw.trim();
        if id.is_empty() {
            let err = SessionError::InvalidHeader("value is blank".to_string());
            return Outcome::Error((err.status(), err));
        }
        if id.len() > MAX_SESSION_ID_LENGTH {
            let err = SessionError::InvalidHeader(format!(
                "value exceeds {} characters",
                MAX_SESSION_ID_LENGTH
            ));
            return Outcome::Error((err.status(), err));
        }

        match request.guard::<&State<SessionRegistry>>().await {
            Outcome::Success(registry) => Outcome::Success(ImportSession(registry.context(id))),
            _ => {
                let err = SessionError::RegistryUnavailable;
                Outcome::Error((err.status(), err))
            }
        }
    }
}

impl<'r> OpenApiFromRequest<'r> for ImportSession {
    fn from_request_input(
        generator: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        let schema = generator.json_schema::<String>();
        Ok(RequestHeaderInput::Parameter(Parameter {
            name: SESSION_HEADER.to_string(),
            location: "header".to_string(),
            description: Some(
                "Client-chosen identifier scoping uploads, progress and jobs to one session."
                    .to_string(),
            ),
            required: true,
            deprecated: false,
            allow_empty_value: false,
            value: ParameterValue::Schema {
                style: None,
                explode: None,
                allow_reserved: false,
                schema,
                example: None,
                examples: None,
            },
            extensions: Object::default(),
        }))
    }
}
