use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;
use crate::error::BookingError;
use crate::ledger::BookingLedger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: BookingLedger,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelBookingResponse {
    pub id: Uuid,
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
pub struct FreeSlotsQuery {
    pub service_id: Uuid,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default = "default_step_minutes")]
    pub step_minutes: i64,
}

fn default_step_minutes() -> i64 {
    15
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/professionals/:id/free-slots", get(free_slots))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::SlotUnavailable | ErrorKind::AlreadyCancelled => StatusCode::CONFLICT,
        ErrorKind::TooLateToCancel => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PersistenceError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(kind: ErrorKind, error: String) -> ApiError {
    (status_for(kind), Json(ErrorResponse { kind, error }))
}

/// Bounds the caller's wait; the ledger finishes or rolls back on its own.
async fn within<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, BookingError>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            if e.is_retryable() {
                tracing::warn!("Retryable booking failure: {}", e);
            }
            Err(error_response(e.kind(), e.to_string()))
        }
        Err(_) => Err(error_response(
            ErrorKind::Timeout,
            "request timed out; query the bookings to learn its outcome".to_string(),
        )),
    }
}

pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<Booking>), ApiError> {
    let booking = within(state.request_timeout, state.ledger.create_booking(request)).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn list_bookings(
    State(state): State<AppState>,
    Query(filter): Query<BookingFilter>,
) -> Result<Json<Vec<Booking>>, ApiError> {
    let bookings = within(state.request_timeout, state.ledger.list_bookings(&filter)).await?;
    Ok(Json(bookings))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, ApiError> {
    let booking = within(state.request_timeout, state.ledger.get_booking(id)).await?;
    Ok(Json(booking))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelBookingResponse>, ApiError> {
    within(state.request_timeout, state.ledger.cancel_booking(id)).await?;
    Ok(Json(CancelBookingResponse {
        id,
        status: BookingStatus::Cancelled,
    }))
}

pub async fn free_slots(
    State(state): State<AppState>,
    Path(professional_id): Path<Uuid>,
    Query(query): Query<FreeSlotsQuery>,
) -> Result<Json<Vec<DateTime<Utc>>>, ApiError> {
    let slots = within(
        state.request_timeout,
        state.ledger.free_slots(
            professional_id,
            query.service_id,
            query.from,
            query.to,
            query.step_minutes,
        ),
    )
    .await?;
    Ok(Json(slots))
}

pub async fn health_check() -> &'static str {
    "OK"
}
