use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{
    accounts::Account,
    deposits::{DepositRecord, DepositStatus, StkCallback},
    offers::OfferCode,
    withdrawals::{WithdrawalRequest, WithdrawalStatus},
};

pub mod catalog;
pub mod memory;
pub mod mpesa;
pub mod postgres;

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Account>, anyhow::Error>;
    /// Overwrites the full record keyed by `account.id`.
    async fn put(&self, account: &Account) -> Result<(), anyhow::Error>;
    async fn scan(&self) -> Result<Vec<Account>, anyhow::Error>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error>;
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Account>, anyhow::Error>;
    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Account>, anyhow::Error>;
    async fn find_by_token(&self, token: &str) -> Result<Option<Account>, anyhow::Error>;
}

#[async_trait]
pub trait DepositRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DepositRecord>, anyhow::Error>;
    async fn put(&self, deposit: &DepositRecord) -> Result<(), anyhow::Error>;
    async fn find_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<DepositRecord>, anyhow::Error>;
    async fn list_by_account(&self, account_id: &str) -> Result<Vec<DepositRecord>, anyhow::Error>;
    async fn list_by_status(
        &self,
        status: DepositStatus,
    ) -> Result<Vec<DepositRecord>, anyhow::Error>;
    /// Keeps a gateway result whose reference is not attached to any deposit yet.
    async fn park_callback(&self, callback: &StkCallback) -> Result<(), anyhow::Error>;
    /// Removes and returns the parked result for `gateway_ref`, if any.
    async fn take_parked_callback(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<StkCallback>, anyhow::Error>;
}

#[async_trait]
pub trait WithdrawalRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<WithdrawalRequest>, anyhow::Error>;
    async fn put(&self, withdrawal: &WithdrawalRequest) -> Result<(), anyhow::Error>;
    async fn list_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error>;
    async fn list_by_status(
        &self,
        status: WithdrawalStatus,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error>;
}

#[async_trait]
pub trait OfferRepository: Send + Sync {
    async fn get(&self, code: &str) -> Result<Option<OfferCode>, anyhow::Error>;
    async fn put(&self, offer: &OfferCode) -> Result<(), anyhow::Error>;
}

/// Writes that change a record and its account together. Either both are
/// stored or neither is.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn commit_deposit(
        &self,
        deposit: &DepositRecord,
        account: &Account,
    ) -> Result<(), anyhow::Error>;
    async fn commit_withdrawal(
        &self,
        withdrawal: &WithdrawalRequest,
        account: &Account,
    ) -> Result<(), anyhow::Error>;
    async fn commit_redemption(
        &self,
        offer: &OfferCode,
        account: &Account,
    ) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, anyhow::Error>;
    async fn set_last_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), anyhow::Error>;
}

/// Handles to every persisted mapping, shared by the services.
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub deposits: Arc<dyn DepositRepository>,
    pub withdrawals: Arc<dyn WithdrawalRepository>,
    pub offers: Arc<dyn OfferRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self::memory(Arc::new(memory::MemoryStore::new()))
    }

    pub fn memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            accounts: store.clone(),
            deposits: store.clone(),
            withdrawals: store.clone(),
            offers: store.clone(),
            ledger: store.clone(),
            jobs: store,
        }
    }

    pub async fn postgres(pool: PgPool) -> Result<Self, anyhow::Error> {
        let store = Arc::new(postgres::PgStore::new(pool));
        store.migrate().await?;

        Ok(Self {
            accounts: store.clone(),
            deposits: store.clone(),
            withdrawals: store.clone(),
            offers: store.clone(),
            ledger: store.clone(),
            jobs: store,
        })
    }
}
