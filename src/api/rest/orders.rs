use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::confirmation::Verification;
use crate::error::DispatchError;
use crate::models::driver::DriverProfile;
use crate::models::event::StatusChange;
use crate::models::order::{NewOrder, Order, OrderStatus, PaymentMethod};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/tracking/:code", get(track_order))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/status", post(advance_status))
        .route("/orders/:id/confirm", post(confirm_delivery))
        .route("/orders/:id/payment", post(record_payment))
        .route("/orders/:id/candidates", get(candidates))
        .route("/orders/:id/history", get(history))
}

/// The only response that reveals the confirmation code, meant for the
/// sender to pass on to the receiver.
#[derive(Serialize)]
pub struct CreatedOrder {
    #[serde(flatten)]
    pub order: Order,
    pub confirmation_code: Option<String>,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub sender_id: Uuid,
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub actor_id: Uuid,
    pub status: OrderStatus,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub driver_id: Uuid,
    pub code: String,
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub reference: String,
}

#[derive(Deserialize)]
pub struct CandidatesQuery {
    pub limit: Option<usize>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<Json<CreatedOrder>, DispatchError> {
    let order = state.coordinator.create_order(payload).await?;
    Ok(Json(CreatedOrder {
        confirmation_code: order.confirmation_code.clone(),
        order,
    }))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, DispatchError> {
    Ok(Json(state.coordinator.orders_for_sender(query.sender_id).await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    Ok(Json(state.coordinator.get_order(id).await?))
}

async fn track_order(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<Order>, DispatchError> {
    state
        .coordinator
        .find_by_tracking_code(&code)
        .await?
        .map(Json)
        .ok_or(DispatchError::UnknownTrackingCode(code))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptRequest>,
) -> Result<Json<Order>, DispatchError> {
    Ok(Json(state.coordinator.accept_order(id, payload.driver_id).await?))
}

async fn advance_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .coordinator
        .advance_status(id, payload.actor_id, payload.status)
        .await?;
    Ok(Json(order))
}

async fn confirm_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ConfirmRequest>,
) -> Result<Json<Verification>, DispatchError> {
    let verification = state
        .coordinator
        .verify_delivery_code(id, payload.driver_id, &payload.code)
        .await?;
    Ok(Json(verification))
}

async fn record_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PaymentRequest>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .coordinator
        .record_payment(id, payload.method, &payload.reference)
        .await?;
    Ok(Json(order))
}

async fn candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<CandidatesQuery>,
) -> Result<Json<Vec<DriverProfile>>, DispatchError> {
    let order = state.coordinator.get_order(id).await?;
    let limit = query.limit.unwrap_or(state.candidate_limit);
    let candidates = state.matcher.find_candidates(&order, limit).await?;
    Ok(Json(candidates.iter().cloned().collect()))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusChange>>, DispatchError> {
    Ok(Json(state.coordinator.status_history(id).await?))
}
