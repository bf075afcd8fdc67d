//! # Credits API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::handlers::types::{BalanceInfo, DepositRequest, ReservationInfo};
use crate::server::AppState;

#[utoipa::path(
    get,
    path = "/credits/{owner_id}",
    params(("owner_id" = Uuid, Path, description = "Account owner")),
    responses(
        (status = 200, description = "Current balance", body = BalanceInfo),
        (status = 404, description = "No account for this owner", body = ApiError)
    ),
    tag = "credits"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<BalanceInfo>, ApiError> {
    Ok(Json(state.engine.balance(owner_id).await?.into()))
}

/// Top up a balance, opening the account on first deposit.
#[utoipa::path(
    post,
    path = "/credits/{owner_id}/deposit",
    params(("owner_id" = Uuid, Path, description = "Account owner")),
    request_body = DepositRequest,
    responses(
        (status = 200, description = "Balance after the deposit", body = BalanceInfo),
        (status = 400, description = "Amount is not positive", body = ApiError)
    ),
    tag = "credits"
)]
pub async fn deposit(
    State(state): State<AppState>,
    Path(owner_id): Path<Uuid>,
    Json(request): Json<DepositRequest>,
) -> Result<Json<BalanceInfo>, ApiError> {
    Ok(Json(
        state.engine.deposit(owner_id, request.amount).await?.into(),
    ))
}

#[utoipa::path(
    get,
    path = "/credits/reservations/{reservation_id}",
    params(("reservation_id" = Uuid, Path, description = "Reservation identifier")),
    responses(
        (status = 200, description = "Reservation record", body = ReservationInfo),
        (status = 404, description = "Unknown reservation", body = ApiError)
    ),
    tag = "credits"
)]
pub async fn get_reservation(
    State(state): State<AppState>,
    Path(reservation_id): Path<Uuid>,
) -> Result<Json<ReservationInfo>, ApiError> {
    Ok(Json(state.engine.reservation(reservation_id).await?.into()))
}
