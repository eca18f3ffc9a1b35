use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError};
use crate::models::{accounts::Account, offers::OfferCode};
use crate::repositories::Repositories;

pub enum OfferServiceRequest {
    Create {
        code: String,
        reward: i64,
        response: oneshot::Sender<Result<OfferCode, ServiceError>>,
    },
    Redeem {
        account_id: String,
        code: String,
        response: oneshot::Sender<Result<Account, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct OfferRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
}

impl OfferRequestHandler {
    pub fn new(repositories: Repositories, locks: KeyedLocks) -> Self {
        OfferRequestHandler {
            repositories,
            locks,
        }
    }

    pub async fn create_offer(&self, code: &str, reward: i64) -> Result<OfferCode, ServiceError> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return Err(ServiceError::Validation("offer code is empty".to_string()));
        }
        if reward <= 0 {
            return Err(ServiceError::Validation(format!(
                "reward must be positive, got {}",
                reward
            )));
        }

        let _guard = self.locks.lock_offer(&code).await;
        let existing = self
            .repositories
            .offers
            .get(&code)
            .await
            .map_err(ServiceError::repository("Offers"))?;
        if existing.is_some() {
            return Err(ServiceError::Validation(format!(
                "offer code {} already exists",
                code
            )));
        }

        let offer = OfferCode::new(code, reward);
        self.repositories
            .offers
            .put(&offer)
            .await
            .map_err(ServiceError::repository("Offers"))?;

        log::info!("Created offer code {} worth {}.", offer.code, offer.reward);
        Ok(offer)
    }

    pub async fn redeem_offer(&self, account_id: &str, code: &str) -> Result<Account, ServiceError> {
        let code = code.trim().to_uppercase();

        let _account_guard = self.locks.lock_account(account_id).await;
        let _offer_guard = self.locks.lock_offer(&code).await;

        let mut offer = self
            .repositories
            .offers
            .get(&code)
            .await
            .map_err(ServiceError::repository("Offers"))?
            .ok_or_else(|| ServiceError::NotFound(format!("offer code {}", code)))?;
        if offer.is_used_by(account_id) {
            return Err(ServiceError::AlreadyProcessed);
        }

        let mut account = self
            .repositories
            .accounts
            .get(account_id)
            .await
            .map_err(ServiceError::repository("Offers"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", account_id)))?;

        account.credit_earning(offer.reward)?;
        offer.used_by.insert(account.id.clone());

        self.repositories
            .ledger
            .commit_redemption(&offer, &account)
            .await
            .map_err(ServiceError::repository("Offers"))?;

        log::info!(
            "Account {} redeemed {} for {}.",
            account.id,
            offer.code,
            offer.reward
        );
        Ok(account)
    }
}

#[async_trait]
impl RequestHandler<OfferServiceRequest> for OfferRequestHandler {
    async fn handle_request(&self, request: OfferServiceRequest) {
        match request {
            OfferServiceRequest::Create {
                code,
                reward,
                response,
            } => {
                let _ = response.send(self.create_offer(&code, reward).await);
            }
            OfferServiceRequest::Redeem {
                account_id,
                code,
                response,
            } => {
                let _ = response.send(self.redeem_offer(&account_id, &code).await);
            }
        }
    }
}

pub struct OfferService;

impl OfferService {
    pub fn new() -> Self {
        OfferService {}
    }
}

#[async_trait]
impl Service<OfferServiceRequest, OfferRequestHandler> for OfferService {}
