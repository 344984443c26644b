use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::SafetyMode;
use crate::db::introspect::SchemaDescription;
use crate::format::DisplayText;
use crate::session::{ConversationTurn, PendingWrite, SharedSession};
use crate::web::state::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// Session types

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub turns: Vec<ConversationTurn>,
    pub pending: Option<PendingWrite>,
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
}

// Schema

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub tables: Vec<String>,
    pub description: SchemaDescription,
    pub text: String,
    pub last_refresh: Option<chrono::DateTime<chrono::Utc>>,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub session_count: usize,
    pub table_count: Option<usize>,
    pub model: String,
    pub backend: String,
    pub safety_mode: SafetyMode,
}

fn find_session(state: &AppState, id: &str) -> ApiResult<SharedSession> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Session '{}' not found", id)))
}

fn join_error(e: tokio::task::JoinError) -> (StatusCode, String) {
    error!("Turn task failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Turn task failed".to_string())
}

// Sessions

pub async fn create_session(state: State<Arc<AppState>>) -> (StatusCode, Json<SessionCreated>) {
    let session = state.sessions.create();
    let id = session.lock().await.id.clone();
    (StatusCode::CREATED, Json(SessionCreated { id }))
}

pub async fn delete_session(state: State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if state.sessions.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("Session '{}' not found", id)))
    }
}

pub async fn get_history(state: State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<SessionHistory>> {
    let session = find_session(&state, &id)?;
    let session = session.lock().await;

    Ok(Json(SessionHistory {
        id: session.id.clone(),
        created_at: session.created_at,
        turns: session.history.turns().cloned().collect(),
        pending: session.pending.clone(),
    }))
}

// Turns
//
// Each turn runs in its own task: if the client goes away the model and
// database calls still finish and the session history stays consistent.

pub async fn ask_question(
    state: State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<QuestionRequest>,
) -> ApiResult<Json<DisplayText>> {
    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question cannot be empty".to_string()));
    }

    let session = find_session(&state, &id)?;
    let engine = Arc::clone(&state.engine);
    info!("Question for session {}: {}", id, payload.question);

    let display = tokio::spawn(async move {
        let mut session = session.lock().await;
        engine.handle_question(&mut session, &payload.question).await
    })
    .await
    .map_err(join_error)?;

    Ok(Json(display))
}

pub async fn confirm_pending(state: State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<DisplayText>> {
    let session = find_session(&state, &id)?;
    let engine = Arc::clone(&state.engine);

    let display = tokio::spawn(async move {
        let mut session = session.lock().await;
        engine.confirm_pending(&mut session).await
    })
    .await
    .map_err(join_error)?;

    Ok(Json(display))
}

pub async fn cancel_pending(state: State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Json<DisplayText>> {
    let session = find_session(&state, &id)?;
    let mut session = session.lock().await;
    Ok(Json(state.engine.cancel_pending(&mut session)))
}

// Schema

async fn schema_response(state: &AppState, refresh: bool) -> ApiResult<Json<SchemaResponse>> {
    let manager = state.engine.schema_manager();
    let schema = if refresh {
        manager.refresh_cache().await
    } else {
        manager.schema().await
    }
    .map_err(|e| {
        error!("Failed to read schema: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, format!("Database error: {}", e))
    })?;

    Ok(Json(SchemaResponse {
        tables: schema.table_names(),
        text: schema.render(),
        description: (*schema).clone(),
        last_refresh: manager.last_refresh().await,
    }))
}

pub async fn get_schema(state: State<Arc<AppState>>) -> ApiResult<Json<SchemaResponse>> {
    schema_response(&state, false).await
}

pub async fn refresh_schema(state: State<Arc<AppState>>) -> ApiResult<Json<SchemaResponse>> {
    schema_response(&state, true).await
}

pub async fn system_status(state: State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    // a database that cannot be read still gets a status answer
    let table_count = match state.engine.schema_manager().schema().await {
        Ok(schema) => Some(schema.tables.len()),
        Err(e) => {
            error!("Failed to read schema for status: {}", e);
            None
        }
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        session_count: state.sessions.len(),
        table_count,
        model: state.engine.model().model().to_string(),
        backend: state.config.llm.backend.clone(),
        safety_mode: state.engine.policy().mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::build_pool;
    use crate::engine::Engine;
    use crate::llm::audit::AuditLog;
    use crate::llm::testing::ScriptedProvider;
    use crate::llm::{ModelClient, RetryPolicy};
    use crate::web::app;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    fn test_app(answer: &str) -> Router {
        let mut config = AppConfig::default();
        config.database.connection_string = ":memory:".to_string();
        let pool = build_pool(&config.database, config.safety.mode).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE customers (id INTEGER PRIMARY KEY, name VARCHAR, country VARCHAR);
                 INSERT INTO customers VALUES (1, 'Ana', 'Spain'), (2, 'Jean', 'France');",
            )
            .unwrap();

        let model = ModelClient::new(
            Arc::new(ScriptedProvider::answering(answer)),
            AuditLog::disabled(),
            Duration::from_secs(5),
            RetryPolicy::new(0, Duration::from_millis(1)),
        );
        let engine = Engine::new(&config, pool, model).unwrap();
        app(Arc::new(AppState::new(config, engine)))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn new_session(app: &Router) -> String {
        let (status, body) = send(app, post_json("/api/sessions", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_question_round_trip() {
        let app = test_app("SELECT name FROM customers WHERE country = 'Spain'");
        let id = new_session(&app).await;

        let (status, body) = send(
            &app,
            post_json(
                &format!("/api/sessions/{}/questions", id),
                serde_json::json!({ "question": "Who is in Spain?" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().contains("| Ana |"));
        assert_eq!(body["total_rows"], 1);

        let history = Request::builder()
            .uri(format!("/api/sessions/{}/history", id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, history).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turns"].as_array().unwrap().len(), 2);
        assert_eq!(body["turns"][0]["role"], "user");
        assert!(body["created_at"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = test_app("SELECT 1");
        let (status, _) = send(
            &app,
            post_json("/api/sessions/nope/questions", serde_json::json!({ "question": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let app = test_app("SELECT 1");
        let id = new_session(&app).await;
        let (status, _) = send(
            &app,
            post_json(&format!("/api/sessions/{}/questions", id), serde_json::json!({ "question": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let app = test_app("SELECT 1");
        let id = new_session(&app).await;

        let delete = |id: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{}", id))
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(send(&app, delete(&id)).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, delete(&id)).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_and_status() {
        let app = test_app("SELECT 1");

        let (status, body) = send(&app, Request::builder().uri("/api/schema").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tables"], serde_json::json!(["customers"]));
        assert!(body["text"].as_str().unwrap().contains("=== TABLE: customers ==="));

        let (status, body) = send(&app, post_json("/api/schema/refresh", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_refresh"].is_string());

        let (status, body) = send(&app, Request::builder().uri("/api/status").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["table_count"], 1);
        assert_eq!(body["model"], "scripted");
        assert_eq!(body["safety_mode"], "read_only");
    }

    #[tokio::test]
    async fn test_cancel_without_pending_write() {
        let app = test_app("SELECT 1");
        let id = new_session(&app).await;
        let (status, body) = send(&app, post_json(&format!("/api/sessions/{}/cancel", id), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().contains("no pending change"));
    }
}
