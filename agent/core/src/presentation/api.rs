// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::application::dispatcher::{DispatchOutcome, EventDispatcher, EventMessage};
use crate::application::synchronizer::{FirewallSyncService, SyncError};
use crate::infrastructure::event_bus::{EventBus, EventBusError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde_json::json;
use std::sync::Arc;

pub struct AppState {
    pub sync_service: Arc<dyn FirewallSyncService>,
    pub dispatcher: EventDispatcher,
    pub event_bus: Arc<EventBus>,
}

pub fn app(service: Arc<dyn FirewallSyncService>, event_bus: Arc<EventBus>) -> Router {
    let state = Arc::new(AppState {
        dispatcher: EventDispatcher::new(service.clone()),
        sync_service: service,
        event_bus,
    });

    Router::new()
        .route("/health", get(health))
        .route("/events", post(post_event))
        .route("/events/stream", get(stream_events))
        .route("/resync", post(resync))
        .route("/state", get(get_state))
        .with_state(state)
}

fn error_response(e: SyncError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "status": "error", "error": e.to_string() })),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn post_event(
    State(state): State<Arc<AppState>>,
    Json(message): Json<EventMessage>,
) -> Response {
    match state.dispatcher.dispatch(message).await {
        Ok(DispatchOutcome::Applied(outcome)) => {
            Json(json!({ "status": "ok", "outcome": outcome })).into_response()
        }
        Ok(DispatchOutcome::Ignored(reason)) => {
            Json(json!({ "status": "ignored", "reason": reason })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn resync(State(state): State<Arc<AppState>>) -> Response {
    match state.sync_service.resync().await {
        Ok(outcome) => Json(json!({ "status": "ok", "outcome": outcome })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.sync_service.state())
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.event_bus.subscribe();
    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Event::default().json_data(&event), receiver)),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
