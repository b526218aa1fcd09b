//! Route definitions for the Session View gateway.
//!
//! Handlers never open sessions themselves: they use the session bound for
//! the request by the session guard.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use view_common::{Error, Result};
use view_session::{
    with_current_session, with_current_session_as, Session, SessionFactoryHandle, SqliteSession,
};

use crate::error_page::ErrorAttributes;

/// Path of the error page requests are re-dispatched to.
pub const ERROR_PATH: &str = "/error";

/// Schema bootstrapped when the session factory is created.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub factory: SessionFactoryHandle,
}

/// A stored note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub created_at: String,
}

/// Create note request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Body rendered by the error page.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPageResponse {
    pub status: u16,
    pub path: String,
    pub method: String,
    pub session_bound: bool,
}

/// Build all routes.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/notes", get(list_notes).post(create_note))
        .route("/api/v1/notes/:id", get(get_note))
        .route(ERROR_PATH, get(error_page))
        .with_state(state)
}

fn row_to_note(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Count stored notes using the ambient session.
pub fn count_notes(factory: &SessionFactoryHandle) -> Result<i64> {
    let counts = with_current_session_as::<SqliteSession, _>(factory, |s| {
        s.query("SELECT COUNT(*) FROM notes", &[], |row| row.get::<_, i64>(0))
    })??;
    Ok(counts.into_iter().next().unwrap_or(0))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "view-gateway".into(),
    })
}

async fn list_notes(State(state): State<AppState>) -> Result<Json<Vec<Note>>> {
    let notes = with_current_session_as::<SqliteSession, _>(&state.factory, |s| {
        s.query(
            "SELECT id, title, body, created_at FROM notes ORDER BY id",
            &[],
            row_to_note,
        )
    })??;
    Ok(Json(notes))
}

async fn get_note(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Note>> {
    let notes = with_current_session_as::<SqliteSession, _>(&state.factory, |s| {
        s.query(
            "SELECT id, title, body, created_at FROM notes WHERE id = ?1",
            &[Value::Integer(id)],
            row_to_note,
        )
    })??;

    notes
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("note {id}")))
}

async fn create_note(
    State(state): State<AppState>,
    Json(req): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<Note>)> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(Error::InvalidInput("title must not be empty".into()));
    }
    let created_at = chrono::Utc::now().to_rfc3339();

    // The bound session never flushes on its own; writes are flushed here.
    let note = with_current_session_as::<SqliteSession, _>(&state.factory, |s| -> Result<Note> {
        s.stage(
            "INSERT INTO notes (title, body, created_at) VALUES (?1, ?2, ?3)",
            vec![
                Value::Text(title.clone()),
                Value::Text(req.body.clone()),
                Value::Text(created_at.clone()),
            ],
        )?;
        s.flush()?;
        Ok(Note {
            id: s.last_insert_rowid()?,
            title,
            body: req.body,
            created_at,
        })
    })??;

    tracing::info!(note_id = note.id, "Created note");
    Ok((StatusCode::CREATED, Json(note)))
}

async fn error_page(
    State(state): State<AppState>,
    attributes: Option<Extension<ErrorAttributes>>,
) -> (StatusCode, Json<ErrorPageResponse>) {
    let session_bound = with_current_session(&state.factory, |s| s.is_open()).unwrap_or(false);

    match attributes {
        Some(Extension(attrs)) => (
            attrs.status,
            Json(ErrorPageResponse {
                status: attrs.status.as_u16(),
                path: attrs.path,
                method: attrs.method.to_string(),
                session_bound,
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorPageResponse {
                status: StatusCode::NOT_FOUND.as_u16(),
                path: ERROR_PATH.into(),
                method: "GET".into(),
                session_bound,
            }),
        ),
    }
}
