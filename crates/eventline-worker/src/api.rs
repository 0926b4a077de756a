// Operational HTTP routes
//
// GET /health                            - liveness plus outbox counters
// GET /boards/:board_id/events?viewer_id - board activity described for a viewer

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use eventline_core::{
    describe, AudienceResolver, DescriptionContext, EventQuery, EventStore, EventlineError,
    FanoutQueue, Names, Preload, QueueStats,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::jobs::FanoutContext;

const DEFAULT_LIMIT: usize = 100;

// ============================================
// App State and Routes
// ============================================

#[derive(Clone)]
pub struct ApiState {
    pub events: Arc<dyn EventStore>,
    pub audience: Arc<dyn AudienceResolver>,
    pub queue: Arc<dyn FanoutQueue>,
}

impl ApiState {
    pub fn from_context(context: &FanoutContext) -> Self {
        Self {
            events: context.events.clone(),
            audience: context.audience.clone(),
            queue: context.queue.clone(),
        }
    }
}

pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/boards/:board_id/events", get(board_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================
// Responses
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pending: usize,
    pub claimed: usize,
    pub dead: usize,
}

impl HealthResponse {
    fn from_stats(stats: QueueStats) -> Self {
        Self {
            status: "ok".to_string(),
            pending: stats.pending,
            claimed: stats.claimed,
            dead: stats.dead,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub viewer_id: Uuid,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityItem {
    pub id: Uuid,
    pub action: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub data: Vec<ActivityItem>,
}

/// Maps domain errors onto HTTP statuses
pub struct ApiError(EventlineError);

impl From<EventlineError> for ApiError {
    fn from(err: EventlineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EventlineError::Validation(_) => StatusCode::BAD_REQUEST,
            EventlineError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

// ============================================
// HTTP Handlers
// ============================================

async fn health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(HealthResponse::from_stats(stats)))
}

async fn board_events(
    State(state): State<ApiState>,
    Path(board_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<ActivityResponse>, ApiError> {
    if state.audience.find_board(board_id).await?.is_none() {
        return Err(EventlineError::not_found("board", board_id).into());
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, 1000);
    let records = state
        .events
        .list_events(
            &EventQuery::for_board(board_id)
                .with_preload(Preload::all())
                .with_limit(limit),
        )
        .await?;

    let mut names = Names::new();
    let mut unresolved = BTreeSet::new();
    for record in &records {
        if let Some(creator) = &record.creator {
            names.insert(creator.id, creator.name.clone());
        }
        unresolved.extend(record.event.assignee_ids());
    }
    let unresolved: Vec<Uuid> = unresolved.into_iter().collect();
    for user in state.audience.find_users(&unresolved).await? {
        names.insert(user.id, user.name);
    }

    let data = records
        .iter()
        .map(|record| {
            let title = record.eventable.as_ref().map(|summary| summary.title.as_str());
            let context = DescriptionContext::new(&names, title);
            ActivityItem {
                id: record.event.id,
                action: record.event.action.clone(),
                description: describe(&record.event, query.viewer_id, &context),
                created_at: record.event.created_at,
            }
        })
        .collect();

    Ok(Json(ActivityResponse { data }))
}
