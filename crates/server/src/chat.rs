//! Chat and conversation endpoints. `POST /api/chat` streams tool progress
//! and the final assistant message over SSE; the conversation endpoints are
//! plain JSON reads. Identity arrives out of band in the `x-user-id` header.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tracing::error;

use taskpilot_agent::orchestrator::{
    ChatRequest, EventSink, Orchestrator, TurnEvent, TurnOutcome,
};
use taskpilot_core::domain::conversation::ConversationId;
use taskpilot_core::domain::task::UserId;
use taskpilot_core::errors::{ChatError, StoreError};
use taskpilot_core::store::ConversationStore;

#[derive(Clone)]
pub struct ChatState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn ConversationStore>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u32>,
}

impl ApiError {
    fn new(error: impl Into<String>) -> Self {
        Self { error: error.into(), retry_after_seconds: None }
    }
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{id}", get(get_conversation))
        .with_state(state)
}

fn user_from_headers(headers: &HeaderMap) -> Result<UserId, (StatusCode, Json<ApiError>)> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| UserId(value.to_string()))
        .ok_or((StatusCode::BAD_REQUEST, Json(ApiError::new("missing x-user-id header"))))
}

fn status_for(chat_error: &ChatError) -> StatusCode {
    match chat_error {
        ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ChatError::Conversation(StoreError::NotFound) => StatusCode::NOT_FOUND,
        ChatError::Conversation(StoreError::Forbidden) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(chat_error: &ChatError) -> ApiError {
    let retry_after_seconds = match chat_error {
        ChatError::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
        _ => None,
    };
    ApiError { error: chat_error.user_message(), retry_after_seconds }
}

fn progress_event(event: &TurnEvent) -> Event {
    match event {
        TurnEvent::Resolving => Event::default()
            .event("status")
            .data(json!({ "state": "resolving" }).to_string()),
        TurnEvent::ToolStarted { tool } => Event::default()
            .event("tool")
            .data(json!({ "tool": tool, "status": "started" }).to_string()),
        TurnEvent::ToolFinished { tool, ok } => Event::default().event("tool").data(
            json!({ "tool": tool, "status": if *ok { "ok" } else { "failed" } }).to_string(),
        ),
    }
}

fn message_event(outcome: &TurnOutcome) -> Event {
    Event::default().event("message").data(
        json!({
            "conversation_id": outcome.conversation.id,
            "rolled_over": outcome.rolled_over,
            "message": outcome.message,
        })
        .to_string(),
    )
}

fn error_event(chat_error: &ChatError) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::to_string(&error_body(chat_error)).unwrap_or_else(|_| "{}".to_string()))
}

/// One chat turn. Rejections that happen before anything streams (rate
/// limiting, an unknown or foreign conversation id) come back as plain HTTP
/// errors; anything after the stream has started is reported as an `error`
/// SSE event.
async fn chat(
    State(state): State<ChatState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ApiError>)> {
    let user = user_from_headers(&headers)?;
    if body.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(ApiError::new("message must not be empty"))));
    }

    let request = ChatRequest {
        user,
        message: body.message,
        conversation_id: body.conversation_id.map(ConversationId),
    };

    let (event_tx, mut event_rx) = mpsc::channel(16);
    let sink = EventSink::new(event_tx);
    let orchestrator = state.orchestrator.clone();
    let mut turn = tokio::spawn(async move { orchestrator.handle(request, &sink).await });

    // Wait for either the first progress event or early completion.
    let mut pending = Vec::new();
    let mut early = None;
    tokio::select! {
        joined = &mut turn => {
            early = Some(join_result(joined));
        }
        received = event_rx.recv() => {
            match received {
                Some(event) => pending.push(event),
                // Channel closed with nothing sent: the turn is finishing.
                None => early = Some(join_result((&mut turn).await)),
            }
        }
    }
    while let Ok(event) = event_rx.try_recv() {
        pending.push(event);
    }

    if pending.is_empty() {
        if let Some(Err(chat_error)) = &early {
            return Err((status_for(chat_error), Json(error_body(chat_error))));
        }
    }

    let (out_tx, out_rx) = mpsc::channel::<Event>(16);
    tokio::spawn(async move {
        for event in &pending {
            let _ = out_tx.send(progress_event(event)).await;
        }
        let result = match early {
            Some(result) => result,
            None => {
                while let Some(event) = event_rx.recv().await {
                    let _ = out_tx.send(progress_event(&event)).await;
                }
                join_result(turn.await)
            }
        };
        let final_event = match &result {
            Ok(outcome) => message_event(outcome),
            Err(chat_error) => {
                error!(error = %chat_error, "chat turn failed after streaming started");
                error_event(chat_error)
            }
        };
        let _ = out_tx.send(final_event).await;
    });

    let stream = ReceiverStream::new(out_rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn join_result(
    joined: Result<Result<TurnOutcome, ChatError>, tokio::task::JoinError>,
) -> Result<TurnOutcome, ChatError> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(ChatError::Internal(format!("chat task panicked: {join_error}"))),
    }
}

async fn list_conversations(
    State(state): State<ChatState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let user = user_from_headers(&headers)?;
    let summaries = state.store.list(&user).await.map_err(store_rejection)?;
    Ok(Json(json!({ "conversations": summaries })))
}

async fn get_conversation(
    State(state): State<ChatState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let user = user_from_headers(&headers)?;
    let (conversation, messages) = state
        .store
        .load(&ConversationId(id), &user)
        .await
        .map_err(store_rejection)?;
    Ok(Json(json!({ "conversation": conversation, "messages": messages })))
}

fn store_rejection(store_error: StoreError) -> (StatusCode, Json<ApiError>) {
    let chat_error = ChatError::Conversation(store_error);
    (status_for(&chat_error), Json(error_body(&chat_error)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use taskpilot_agent::limiter::RateLimiter;
    use taskpilot_agent::orchestrator::Orchestrator;
    use taskpilot_agent::resolver::HeuristicResolver;
    use taskpilot_db::{InMemoryConversationStore, InMemoryTaskCapability};

    use super::{router, ChatState};

    fn test_state(limit: u32) -> ChatState {
        let store = Arc::new(InMemoryConversationStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(InMemoryTaskCapability::new()),
            Arc::new(HeuristicResolver::new()),
            RateLimiter::new(limit, Duration::from_secs(60)),
            Duration::from_secs(5),
        ));
        ChatState { orchestrator, store }
    }

    fn chat_request(user: Option<&str>, body: &str) -> Request<Body> {
        let mut builder =
            Request::builder().method("POST").uri("/api/chat").header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    #[tokio::test]
    async fn chat_without_identity_is_a_bad_request() {
        let app = router(test_state(60));
        let response = app
            .oneshot(chat_request(None, r#"{"message":"add buy milk"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_with_an_empty_message_is_a_bad_request() {
        let app = router(test_state(60));
        let response = app
            .oneshot(chat_request(Some("u-1"), r#"{"message":"   "}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_streams_events_and_the_final_message() {
        let app = router(test_state(60));
        let response = app
            .oneshot(chat_request(Some("u-1"), r#"{"message":"add buy milk"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );

        let raw = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        let text = String::from_utf8(raw.to_vec()).expect("utf8");
        assert!(text.contains("event: tool"));
        assert!(text.contains("add_task"));
        assert!(text.contains("event: message"));
        assert!(text.contains("buy milk"));
    }

    #[tokio::test]
    async fn rate_limited_chat_is_a_plain_429_with_retry_hint() {
        let app = router(test_state(1));
        let first = app
            .clone()
            .oneshot(chat_request(Some("u-1"), r#"{"message":"add buy milk"}"#))
            .await
            .expect("first response");
        assert_eq!(first.status(), StatusCode::OK);
        // Drain the stream so the first turn completes.
        let _ = axum::body::to_bytes(first.into_body(), 1024 * 1024).await;

        let second = app
            .oneshot(chat_request(Some("u-1"), r#"{"message":"add call mom"}"#))
            .await
            .expect("second response");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let raw = axum::body::to_bytes(second.into_body(), 1024).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert!(payload["retry_after_seconds"].as_u64().expect("retry hint") >= 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_a_404() {
        let app = router(test_state(60));
        let response = app
            .oneshot(
                chat_request(
                    Some("u-1"),
                    r#"{"message":"add buy milk","conversation_id":"no-such-conversation"}"#,
                ),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn conversation_reads_are_scoped_to_the_requesting_user() {
        let app = router(test_state(60));
        let first = app
            .clone()
            .oneshot(chat_request(Some("u-1"), r#"{"message":"add buy milk"}"#))
            .await
            .expect("chat response");
        let raw = axum::body::to_bytes(first.into_body(), 1024 * 1024).await.expect("body");
        let text = String::from_utf8(raw.to_vec()).expect("utf8");
        let conversation_id = text
            .lines()
            .find(|line| line.starts_with("data:") && line.contains("conversation_id"))
            .and_then(|line| {
                let payload: serde_json::Value =
                    serde_json::from_str(line.trim_start_matches("data:").trim()).ok()?;
                Some(payload["conversation_id"].as_str()?.to_string())
            })
            .expect("conversation id in stream");

        let owner = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{conversation_id}"))
                    .header("x-user-id", "u-1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("owner read");
        assert_eq!(owner.status(), StatusCode::OK);

        let stranger = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/conversations/{conversation_id}"))
                    .header("x-user-id", "u-2")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("stranger read");
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn listing_conversations_returns_the_users_summaries() {
        let app = router(test_state(60));
        let chat = app
            .clone()
            .oneshot(chat_request(Some("u-1"), r#"{"message":"add buy milk"}"#))
            .await
            .expect("chat response");
        let _ = axum::body::to_bytes(chat.into_body(), 1024 * 1024).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/conversations")
                    .header("x-user-id", "u-1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("list response");
        assert_eq!(response.status(), StatusCode::OK);
        let raw = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(payload["conversations"].as_array().expect("array").len(), 1);
    }
}
