use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use super::{accounts::AccountServiceRequest, Channels, ServiceError};
use crate::models::accounts::Account;

mod accounts;
mod admin;
mod ledger;

pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

#[derive(Clone)]
pub struct AppState {
    channels: Channels,
    admin_secret: Arc<String>,
    callback_token: Arc<String>,
}

/// Sends a request to a service loop and waits for its reply.
async fn dispatch<R, T>(
    channel: &mpsc::Sender<R>,
    request: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
) -> Result<T, ServiceError> {
    let (response_tx, response_rx) = oneshot::channel();

    channel
        .send(request(response_tx))
        .await
        .map_err(|e| ServiceError::Communication("HTTP".to_string(), e.to_string()))?;

    response_rx
        .await
        .map_err(|e| ServiceError::Communication("HTTP".to_string(), e.to_string()))?
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation error"),
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            ServiceError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ServiceError::DuplicatePending => (StatusCode::CONFLICT, "Duplicate pending request"),
            ServiceError::InsufficientFunds => {
                (StatusCode::PAYMENT_REQUIRED, "Insufficient funds")
            }
            ServiceError::GatewayUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "Payment gateway unavailable")
            }
            ServiceError::AlreadyProcessed => (StatusCode::CONFLICT, "Already processed"),
            ServiceError::Internal(_)
            | ServiceError::Repository(_, _)
            | ServiceError::Communication(_, _) => {
                log::error!("Request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (
            status,
            Json(json!({
                "error": error,
                "details": self.to_string()
            })),
        )
            .into_response()
    }
}

/// The account behind the request's bearer token.
pub struct CurrentAccount(pub Account);

impl FromRequestParts<AppState> for CurrentAccount {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .ok_or(ServiceError::Unauthorized)?;

        let account = dispatch(&state.channels.accounts, |response| {
            AccountServiceRequest::Authenticate { token, response }
        })
        .await?;

        Ok(CurrentAccount(account))
    }
}

/// Present on requests carrying the configured admin secret.
pub struct AdminAccess;

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let secret = parts
            .headers
            .get(ADMIN_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());

        let expected = state.admin_secret.as_str();
        match secret {
            Some(secret) if !expected.is_empty() && secret == expected => Ok(AdminAccess),
            _ => {
                log::warn!("Rejected admin request without a valid secret.");
                Err(ServiceError::Unauthorized)
            }
        }
    }
}

/// Present on callbacks posted to the configured token path. Daraja cannot
/// send headers, so the token travels in the callback URL.
pub struct CallbackAccess;

impl FromRequestParts<AppState> for CallbackAccess {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = Path::<String>::from_request_parts(parts, state)
            .await
            .map(|Path(token)| token)
            .ok();

        let expected = state.callback_token.as_str();
        match token {
            Some(token) if !expected.is_empty() && token == expected => Ok(CallbackAccess),
            _ => {
                log::warn!("Rejected M-PESA callback on an unknown path.");
                Err(ServiceError::Unauthorized)
            }
        }
    }
}

pub fn router(channels: Channels, admin_secret: String, callback_token: String) -> Router {
    let app_state = AppState {
        channels,
        admin_secret: Arc::new(admin_secret),
        callback_token: Arc::new(callback_token),
    };

    Router::new()
        .route("/accounts", post(accounts::register))
        .route("/sessions", post(accounts::login))
        .route("/me", get(accounts::me))
        .route("/catalog", get(ledger::list_catalog))
        .route("/fridges", post(ledger::buy_fridge))
        .route(
            "/deposits",
            post(ledger::request_deposit).get(ledger::list_deposits),
        )
        .route(
            "/withdrawals",
            post(ledger::request_withdrawal).get(ledger::list_withdrawals),
        )
        .route("/offers/redeem", post(ledger::redeem_offer))
        .route("/mpesa/callback/{token}", post(ledger::mpesa_callback))
        .route("/admin/deposits", get(admin::list_pending_deposits))
        .route("/admin/deposits/{id}/confirm", post(admin::confirm_deposit))
        .route("/admin/deposits/{id}/fail", post(admin::fail_deposit))
        .route("/admin/withdrawals", get(admin::list_pending_withdrawals))
        .route(
            "/admin/withdrawals/{id}/approve",
            post(admin::approve_withdrawal),
        )
        .route(
            "/admin/withdrawals/{id}/reject",
            post(admin::reject_withdrawal),
        )
        .route("/admin/catalog/{id}/lock", post(admin::lock_product))
        .route("/admin/catalog/{id}/unlock", post(admin::unlock_product))
        .route("/admin/offers", post(admin::create_offer))
        .route("/admin/accrual/run", post(admin::run_accrual))
        .route("/health", get(|| async { "OK" }))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(
    listen: &str,
    channels: Channels,
    admin_secret: String,
    callback_token: String,
) -> Result<(), anyhow::Error> {
    let app = router(channels, admin_secret, callback_token);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
