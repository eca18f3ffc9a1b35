use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError};
use crate::models::accounts::{Account, FridgeHolding, OfferWindow};
use crate::models::catalog::{CatalogEntry, ProductKind, UnlockOffer};
use crate::repositories::{catalog::Catalog, Repositories};

pub enum CatalogServiceRequest {
    List {
        response: oneshot::Sender<Result<Vec<CatalogEntry>, ServiceError>>,
    },
    Lock {
        id: String,
        response: oneshot::Sender<Result<CatalogEntry, ServiceError>>,
    },
    Unlock {
        id: String,
        terms: UnlockOffer,
        response: oneshot::Sender<Result<CatalogEntry, ServiceError>>,
    },
    BuyFridge {
        account_id: String,
        product_id: String,
        response: oneshot::Sender<Result<Account, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct CatalogRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
    catalog: Catalog,
}

impl CatalogRequestHandler {
    pub fn new(repositories: Repositories, locks: KeyedLocks, catalog: Catalog) -> Self {
        CatalogRequestHandler {
            repositories,
            locks,
            catalog,
        }
    }

    pub async fn list(&self) -> Vec<CatalogEntry> {
        self.catalog.list().await
    }

    pub async fn lock(&self, id: &str) -> Result<CatalogEntry, ServiceError> {
        Ok(self.catalog.lock(id).await?)
    }

    pub async fn unlock(&self, id: &str, terms: &UnlockOffer) -> Result<CatalogEntry, ServiceError> {
        Ok(self.catalog.unlock(id, terms, Utc::now()).await?)
    }

    pub async fn buy_fridge(
        &self,
        account_id: &str,
        product_id: &str,
    ) -> Result<Account, ServiceError> {
        self.buy_fridge_at(account_id, product_id, Utc::now()).await
    }

    pub(crate) async fn buy_fridge_at(
        &self,
        account_id: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, ServiceError> {
        let entry = self.catalog.find(product_id).await?;
        if !entry.is_unlocked() {
            return Err(ServiceError::Validation(format!(
                "product {} is locked",
                product_id
            )));
        }

        let _guard = self.locks.lock_account(account_id).await;
        let mut account = self
            .repositories
            .accounts
            .get(account_id)
            .await
            .map_err(ServiceError::repository("Catalog"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", account_id)))?;

        account.debit_balance(entry.price)?;
        account.fridges.push(holding_from(&entry, now));

        self.repositories
            .accounts
            .put(&account)
            .await
            .map_err(ServiceError::repository("Catalog"))?;

        log::info!(
            "Account {} bought {} for {}.",
            account.id,
            entry.id,
            entry.price
        );
        Ok(account)
    }
}

fn holding_from(entry: &CatalogEntry, now: DateTime<Utc>) -> FridgeHolding {
    let offer = match entry.kind {
        ProductKind::Fixed => None,
        ProductKind::Offer => Some(OfferWindow {
            start_time: now,
            duration_hours: entry.duration_hours.unwrap_or(0),
            paid: false,
        }),
    };

    FridgeHolding {
        product_id: entry.id.clone(),
        name: entry.name.clone(),
        price: entry.price,
        daily_earn: entry.daily_earn,
        acquired_at: now,
        offer,
    }
}

#[async_trait]
impl RequestHandler<CatalogServiceRequest> for CatalogRequestHandler {
    async fn handle_request(&self, request: CatalogServiceRequest) {
        match request {
            CatalogServiceRequest::List { response } => {
                let _ = response.send(Ok(self.list().await));
            }
            CatalogServiceRequest::Lock { id, response } => {
                let _ = response.send(self.lock(&id).await);
            }
            CatalogServiceRequest::Unlock {
                id,
                terms,
                response,
            } => {
                let _ = response.send(self.unlock(&id, &terms).await);
            }
            CatalogServiceRequest::BuyFridge {
                account_id,
                product_id,
                response,
            } => {
                let _ = response.send(self.buy_fridge(&account_id, &product_id).await);
            }
        }
    }
}

pub struct CatalogService;

impl CatalogService {
    pub fn new() -> Self {
        CatalogService {}
    }
}

#[async_trait]
impl Service<CatalogServiceRequest, CatalogRequestHandler> for CatalogService {}
