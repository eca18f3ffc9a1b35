use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::{dispatch, AdminAccess, AppState};
use crate::models::{
    catalog::{CatalogEntry, UnlockOffer},
    deposits::{DepositRecord, FailDeposit},
    jobs::AccrualOutcome,
    offers::{NewOfferCode, OfferCode},
    withdrawals::{RejectWithdrawal, WithdrawalRequest},
};
use crate::services::{
    accrual::AccrualServiceRequest, catalog::CatalogServiceRequest,
    deposits::DepositServiceRequest, offers::OfferServiceRequest,
    withdrawals::WithdrawalServiceRequest, ServiceError,
};

const DEFAULT_FAILURE_REASON: &str = "failed by admin";

pub async fn confirm_deposit(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(deposit_id): Path<String>,
) -> Result<Json<DepositRecord>, ServiceError> {
    let deposit = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::Confirm {
            deposit_id,
            response,
        }
    })
    .await?;

    Ok(Json(deposit))
}

pub async fn fail_deposit(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(deposit_id): Path<String>,
    req: Option<Json<FailDeposit>>,
) -> Result<Json<DepositRecord>, ServiceError> {
    let reason = req
        .and_then(|Json(req)| req.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());

    let deposit = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::Fail {
            deposit_id,
            reason,
            response,
        }
    })
    .await?;

    Ok(Json(deposit))
}

pub async fn list_pending_deposits(
    _admin: AdminAccess,
    State(state): State<AppState>,
) -> Result<Json<Vec<DepositRecord>>, ServiceError> {
    let deposits = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::ListPending { response }
    })
    .await?;

    Ok(Json(deposits))
}

pub async fn list_pending_withdrawals(
    _admin: AdminAccess,
    State(state): State<AppState>,
) -> Result<Json<Vec<WithdrawalRequest>>, ServiceError> {
    let withdrawals = dispatch(&state.channels.withdrawals, |response| {
        WithdrawalServiceRequest::ListPending { response }
    })
    .await?;

    Ok(Json(withdrawals))
}

pub async fn approve_withdrawal(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(withdrawal_id): Path<String>,
) -> Result<Json<WithdrawalRequest>, ServiceError> {
    let withdrawal = dispatch(&state.channels.withdrawals, |response| {
        WithdrawalServiceRequest::Approve {
            withdrawal_id,
            response,
        }
    })
    .await?;

    Ok(Json(withdrawal))
}

pub async fn reject_withdrawal(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(withdrawal_id): Path<String>,
    Json(req): Json<RejectWithdrawal>,
) -> Result<Json<WithdrawalRequest>, ServiceError> {
    let withdrawal = dispatch(&state.channels.withdrawals, |response| {
        WithdrawalServiceRequest::Reject {
            withdrawal_id,
            reason: req.reason,
            response,
        }
    })
    .await?;

    Ok(Json(withdrawal))
}

pub async fn lock_product(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CatalogEntry>, ServiceError> {
    let entry = dispatch(&state.channels.catalog, |response| {
        CatalogServiceRequest::Lock { id, response }
    })
    .await?;

    Ok(Json(entry))
}

pub async fn unlock_product(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(terms): Json<UnlockOffer>,
) -> Result<Json<CatalogEntry>, ServiceError> {
    let entry = dispatch(&state.channels.catalog, |response| {
        CatalogServiceRequest::Unlock {
            id,
            terms,
            response,
        }
    })
    .await?;

    Ok(Json(entry))
}

pub async fn create_offer(
    _admin: AdminAccess,
    State(state): State<AppState>,
    Json(req): Json<NewOfferCode>,
) -> Result<(StatusCode, Json<OfferCode>), ServiceError> {
    let offer = dispatch(&state.channels.offers, |response| {
        OfferServiceRequest::Create {
            code: req.code,
            reward: req.reward,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(offer)))
}

pub async fn run_accrual(
    _admin: AdminAccess,
    State(state): State<AppState>,
) -> Result<Json<AccrualOutcome>, ServiceError> {
    let outcome = dispatch(&state.channels.accrual, |response| {
        AccrualServiceRequest::Run { response }
    })
    .await?;

    Ok(Json(outcome))
}
