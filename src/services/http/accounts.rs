use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use super::{dispatch, AppState, CurrentAccount};
use crate::models::accounts::{Account, Credentials, NewAccount};
use crate::services::{accounts::AccountServiceRequest, ServiceError};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<NewAccount>,
) -> Result<(StatusCode, Json<Account>), ServiceError> {
    let account = dispatch(&state.channels.accounts, |response| {
        AccountServiceRequest::Register {
            account: req,
            response,
        }
    })
    .await?;

    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<Json<Value>, ServiceError> {
    let token = dispatch(&state.channels.accounts, |response| {
        AccountServiceRequest::Login {
            credentials: req,
            response,
        }
    })
    .await?;

    Ok(Json(json!({ "token": token })))
}

pub async fn me(CurrentAccount(account): CurrentAccount) -> Json<Account> {
    Json(account)
}
