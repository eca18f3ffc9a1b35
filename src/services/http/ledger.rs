use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use super::{dispatch, AppState, CallbackAccess, CurrentAccount};
use crate::models::{
    accounts::Account,
    catalog::{BuyFridge, CatalogEntry},
    deposits::{DarajaCallback, DepositRecord, NewDeposit},
    offers::RedeemOffer,
    withdrawals::{NewWithdrawal, WithdrawalRequest},
};
use crate::services::{
    catalog::CatalogServiceRequest, deposits::DepositServiceRequest,
    offers::OfferServiceRequest, withdrawals::WithdrawalServiceRequest, ServiceError,
};

pub async fn list_catalog(
    State(state): State<AppState>,
) -> Result<Json<Vec<CatalogEntry>>, ServiceError> {
    let entries = dispatch(&state.channels.catalog, |response| {
        CatalogServiceRequest::List { response }
    })
    .await?;

    Ok(Json(entries))
}

pub async fn buy_fridge(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    Json(req): Json<BuyFridge>,
) -> Result<(StatusCode, Json<Account>), ServiceError> {
    let account = dispatch(&state.channels.catalog, |response| {
        CatalogServiceRequest::BuyFridge {
            account_id: account.id,
            product_id: req.product_id,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn request_deposit(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    Json(req): Json<NewDeposit>,
) -> Result<(StatusCode, Json<DepositRecord>), ServiceError> {
    let deposit = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::NewDeposit {
            account_id: account.id,
            amount: req.amount,
            phone: req.phone,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(deposit)))
}

pub async fn list_deposits(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
) -> Result<Json<Vec<DepositRecord>>, ServiceError> {
    let deposits = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::ListDeposits {
            account_id: account.id,
            response,
        }
    })
    .await?;

    Ok(Json(deposits))
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    Json(req): Json<NewWithdrawal>,
) -> Result<(StatusCode, Json<WithdrawalRequest>), ServiceError> {
    let withdrawal = dispatch(&state.channels.withdrawals, |response| {
        WithdrawalServiceRequest::NewWithdrawal {
            account_id: account.id,
            amount: req.amount,
            phone: req.phone,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(withdrawal)))
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
) -> Result<Json<Vec<WithdrawalRequest>>, ServiceError> {
    let withdrawals = dispatch(&state.channels.withdrawals, |response| {
        WithdrawalServiceRequest::ListWithdrawals {
            account_id: account.id,
            response,
        }
    })
    .await?;

    Ok(Json(withdrawals))
}

pub async fn redeem_offer(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    Json(req): Json<RedeemOffer>,
) -> Result<Json<Account>, ServiceError> {
    let account = dispatch(&state.channels.offers, |response| {
        OfferServiceRequest::Redeem {
            account_id: account.id,
            code: req.code,
            response,
        }
    })
    .await?;

    Ok(Json(account))
}

/// Daraja retries callbacks it considers undelivered, so every callback on
/// the token path is acknowledged and problems are only logged.
pub async fn mpesa_callback(
    _gateway: CallbackAccess,
    State(state): State<AppState>,
    body: Bytes,
) -> Json<Value> {
    let accepted = Json(json!({"ResultCode": 0, "ResultDesc": "Accepted"}));

    let callback = match serde_json::from_slice::<DarajaCallback>(&body) {
        Ok(callback) => callback.body.stk_callback,
        Err(e) => {
            log::warn!("Ignoring malformed M-PESA callback: {}", e);
            return accepted;
        }
    };

    let checkout_request_id = callback.checkout_request_id.clone();
    let result = dispatch(&state.channels.deposits, |response| {
        DepositServiceRequest::GatewayCallback { callback, response }
    })
    .await;

    match result {
        Ok(deposit) => {
            log::info!(
                "M-PESA callback {} applied, deposit {} is {}.",
                checkout_request_id,
                deposit.id,
                deposit.status
            );
        }
        Err(e) => {
            log::warn!("M-PESA callback {} not applied: {}", checkout_request_id, e);
        }
    }

    accepted
}
