use crate::orchestrator::Orchestrator;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parley_shared::models::{ModelSpec, MODELS};
use parley_shared::{ChatRequest, ErrorBody, EventKind, StreamingError, WireEvent};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const NDJSON: &str = "application/x-ndjson";

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/chat", post(chat))
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    models: &'static [ModelSpec],
    default_model: String,
    tools: Vec<&'static str>,
}

async fn list_models(State(orchestrator): State<Arc<Orchestrator>>) -> Json<ModelList> {
    Json(ModelList {
        models: MODELS,
        default_model: orchestrator.config().default_model.clone(),
        tools: orchestrator.tools().names().collect(),
    })
}

fn error_response(body: ErrorBody) -> Response {
    let status = StatusCode::from_u16(body.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn streaming_error_response(error: &StreamingError) -> Response {
    warn!(kind = error.name(), error = %error, "chat request failed before streaming");
    error_response(ErrorBody::from(error))
}

async fn chat(
    State(orchestrator): State<Arc<Orchestrator>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "malformed chat request");
            return error_response(ErrorBody::GenericOpenAi {
                message: rejection.body_text(),
            });
        }
    };
    info!(
        model = %request.model_id,
        messages = request.messages.len(),
        tools = request.selected_tools.len(),
        "chat request"
    );

    let prepared = match orchestrator.prepare(request).await {
        Ok(prepared) => prepared,
        Err(e) => return streaming_error_response(&e),
    };
    let mut events = orchestrator.start(prepared);

    // Until the provider accepts the request a failure can still be reported
    // through the status line.
    let first = match events.recv().await {
        Some(event) => event,
        None => {
            error!("completion task ended without emitting an event");
            return error_response(ErrorBody::unexpected("Unexpected error"));
        }
    };
    if first.event == EventKind::Error.as_str() {
        let error = first
            .data
            .first()
            .map(StreamingError::from_wire)
            .unwrap_or_else(StreamingError::unknown);
        return streaming_error_response(&error);
    }

    ([(CONTENT_TYPE, NDJSON)], Body::from_stream(ndjson(first, events))).into_response()
}

fn ndjson(
    first: WireEvent,
    events: mpsc::Receiver<WireEvent>,
) -> impl futures_util::Stream<Item = Result<String, Infallible>> {
    futures_util::stream::unfold((Some(first), events), |(pending, mut events)| async move {
        let event = match pending {
            Some(event) => event,
            None => events.recv().await?,
        };
        Some((Ok(event.to_line()), (None, events)))
    })
}
