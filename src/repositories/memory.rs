use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    AccountRepository, DepositRepository, JobRepository, LedgerRepository, OfferRepository,
    WithdrawalRepository,
};
use crate::models::{
    accounts::Account,
    deposits::{DepositRecord, DepositStatus, StkCallback},
    offers::OfferCode,
    withdrawals::{WithdrawalRequest, WithdrawalStatus},
};

/// Process-local store. Records are cloned in and out so callers never hold
/// references into the maps.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, Account>,
    deposits: DashMap<String, DepositRecord>,
    parked_callbacks: DashMap<String, StkCallback>,
    withdrawals: DashMap<String, WithdrawalRequest>,
    offers: DashMap<String, OfferCode>,
    jobs: DashMap<String, DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_account<F>(&self, predicate: F) -> Option<Account>
    where
        F: Fn(&Account) -> bool,
    {
        self.accounts
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.accounts.get(id).map(|a| a.value().clone()))
    }

    async fn put(&self, account: &Account) -> Result<(), anyhow::Error> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Account>, anyhow::Error> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.find_account(|a| a.email.as_deref() == Some(email)))
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.find_account(|a| a.phone.as_deref() == Some(phone)))
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.find_account(|a| a.referral_code == code))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.find_account(|a| a.api_token.as_deref() == Some(token)))
    }
}

#[async_trait]
impl DepositRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<DepositRecord>, anyhow::Error> {
        Ok(self.deposits.get(id).map(|d| d.value().clone()))
    }

    async fn put(&self, deposit: &DepositRecord) -> Result<(), anyhow::Error> {
        self.deposits.insert(deposit.id.clone(), deposit.clone());
        Ok(())
    }

    async fn find_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<DepositRecord>, anyhow::Error> {
        Ok(self
            .deposits
            .iter()
            .find(|d| d.gateway_ref.as_deref() == Some(gateway_ref))
            .map(|d| d.value().clone()))
    }

    async fn list_by_account(&self, account_id: &str) -> Result<Vec<DepositRecord>, anyhow::Error> {
        let mut deposits: Vec<DepositRecord> = self
            .deposits
            .iter()
            .filter(|d| d.account_id == account_id)
            .map(|d| d.value().clone())
            .collect();
        deposits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deposits)
    }

    async fn list_by_status(
        &self,
        status: DepositStatus,
    ) -> Result<Vec<DepositRecord>, anyhow::Error> {
        let mut deposits: Vec<DepositRecord> = self
            .deposits
            .iter()
            .filter(|d| d.status == status)
            .map(|d| d.value().clone())
            .collect();
        deposits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deposits)
    }

    async fn park_callback(&self, callback: &StkCallback) -> Result<(), anyhow::Error> {
        self.parked_callbacks
            .insert(callback.checkout_request_id.clone(), callback.clone());
        Ok(())
    }

    async fn take_parked_callback(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<StkCallback>, anyhow::Error> {
        Ok(self
            .parked_callbacks
            .remove(gateway_ref)
            .map(|(_, callback)| callback))
    }
}

#[async_trait]
impl WithdrawalRepository for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<WithdrawalRequest>, anyhow::Error> {
        Ok(self.withdrawals.get(id).map(|w| w.value().clone()))
    }

    async fn put(&self, withdrawal: &WithdrawalRequest) -> Result<(), anyhow::Error> {
        self.withdrawals
            .insert(withdrawal.id.clone(), withdrawal.clone());
        Ok(())
    }

    async fn list_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error> {
        let mut withdrawals: Vec<WithdrawalRequest> = self
            .withdrawals
            .iter()
            .filter(|w| w.account_id == account_id)
            .map(|w| w.value().clone())
            .collect();
        withdrawals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(withdrawals)
    }

    async fn list_by_status(
        &self,
        status: WithdrawalStatus,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error> {
        let mut withdrawals: Vec<WithdrawalRequest> = self
            .withdrawals
            .iter()
            .filter(|w| w.status == status)
            .map(|w| w.value().clone())
            .collect();
        withdrawals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(withdrawals)
    }
}

#[async_trait]
impl OfferRepository for MemoryStore {
    async fn get(&self, code: &str) -> Result<Option<OfferCode>, anyhow::Error> {
        Ok(self.offers.get(code).map(|o| o.value().clone()))
    }

    async fn put(&self, offer: &OfferCode) -> Result<(), anyhow::Error> {
        self.offers.insert(offer.code.clone(), offer.clone());
        Ok(())
    }
}

// Map inserts cannot fail, so writing the record and then the account is
// already all-or-nothing here.
#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn commit_deposit(
        &self,
        deposit: &DepositRecord,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.deposits.insert(deposit.id.clone(), deposit.clone());
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn commit_withdrawal(
        &self,
        withdrawal: &WithdrawalRequest,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.withdrawals
            .insert(withdrawal.id.clone(), withdrawal.clone());
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn commit_redemption(
        &self,
        offer: &OfferCode,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.offers.insert(offer.code.clone(), offer.clone());
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, anyhow::Error> {
        Ok(self.jobs.get(job).map(|at| *at.value()))
    }

    async fn set_last_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), anyhow::Error> {
        self.jobs.insert(job.to_string(), at);
        Ok(())
    }
}

/// Ledger writes that fail while `failing` is set, for exercising the error
/// paths of the services.
#[cfg(test)]
pub(crate) struct FlakyLedger {
    pub inner: std::sync::Arc<MemoryStore>,
    pub failing: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyLedger {
    fn check(&self) -> Result<(), anyhow::Error> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection reset"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait]
impl LedgerRepository for FlakyLedger {
    async fn commit_deposit(
        &self,
        deposit: &DepositRecord,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner.commit_deposit(deposit, account).await
    }

    async fn commit_withdrawal(
        &self,
        withdrawal: &WithdrawalRequest,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner.commit_withdrawal(withdrawal, account).await
    }

    async fn commit_redemption(
        &self,
        offer: &OfferCode,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        self.check()?;
        self.inner.commit_redemption(offer, account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, email: &str, code: &str) -> Account {
        Account::new(
            id.to_string(),
            Some(email.to_string()),
            None,
            "hash".to_string(),
            code.to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn put_overwrites_the_whole_record() {
        let store = MemoryStore::new();
        let mut acc = account("a1", "a1@example.com", "CODEA1");
        AccountRepository::put(&store, &acc).await.unwrap();

        acc.balance = 700;
        acc.fridges.clear();
        AccountRepository::put(&store, &acc).await.unwrap();

        let stored = AccountRepository::get(&store, "a1").await.unwrap().unwrap();
        assert_eq!(stored, acc);
        assert!(AccountRepository::get(&store, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookups_by_secondary_keys() {
        let store = MemoryStore::new();
        let mut acc = account("a1", "a1@example.com", "CODEA1");
        acc.api_token = Some("token-1".to_string());
        AccountRepository::put(&store, &acc).await.unwrap();
        AccountRepository::put(&store, &account("a2", "a2@example.com", "CODEA2"))
            .await
            .unwrap();

        let by_email = store.find_by_email("a2@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, "a2");
        let by_code = store.find_by_referral_code("CODEA1").await.unwrap().unwrap();
        assert_eq!(by_code.id, "a1");
        let by_token = store.find_by_token("token-1").await.unwrap().unwrap();
        assert_eq!(by_token.id, "a1");
        assert!(store.find_by_phone("254700000000").await.unwrap().is_none());
        assert_eq!(store.scan().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deposits_are_found_by_gateway_ref_and_status() {
        let store = MemoryStore::new();
        let mut deposit = DepositRecord::pending(
            "d1".to_string(),
            "a1".to_string(),
            1000,
            "254700000001".to_string(),
        );
        deposit.gateway_ref = Some("ws_CO_1".to_string());
        DepositRepository::put(&store, &deposit).await.unwrap();

        let found = store.find_by_gateway_ref("ws_CO_1").await.unwrap().unwrap();
        assert_eq!(found.id, "d1");
        assert_eq!(
            DepositRepository::list_by_status(&store, DepositStatus::Pending)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(DepositRepository::list_by_status(&store, DepositStatus::Confirmed)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn parked_callbacks_are_taken_once() {
        let store = MemoryStore::new();
        let callback = StkCallback {
            merchant_request_id: None,
            checkout_request_id: "ws_CO_early".to_string(),
            result_code: 0,
            result_desc: None,
        };
        store.park_callback(&callback).await.unwrap();

        let taken = store.take_parked_callback("ws_CO_early").await.unwrap().unwrap();
        assert_eq!(taken.checkout_request_id, "ws_CO_early");
        assert!(store.take_parked_callback("ws_CO_early").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commits_store_record_and_account() {
        let store = MemoryStore::new();
        let mut acc = account("a1", "a1@example.com", "CODEA1");
        acc.balance = 250;
        let deposit = DepositRecord::pending(
            "d1".to_string(),
            "a1".to_string(),
            250,
            "254700000001".to_string(),
        );

        store.commit_deposit(&deposit, &acc).await.unwrap();
        assert_eq!(
            DepositRepository::get(&store, "d1").await.unwrap().unwrap(),
            deposit
        );
        assert_eq!(
            AccountRepository::get(&store, "a1").await.unwrap().unwrap().balance,
            250
        );
    }

    #[tokio::test]
    async fn job_last_run_round_trips() {
        let store = MemoryStore::new();
        assert!(store.last_run("daily_accrual").await.unwrap().is_none());

        let now = Utc::now();
        store.set_last_run("daily_accrual", now).await.unwrap();
        assert_eq!(store.last_run("daily_accrual").await.unwrap(), Some(now));
    }
}
