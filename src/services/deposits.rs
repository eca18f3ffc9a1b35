use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::notifications::{Notification, Notifier};
use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError};
use crate::models::deposits::{DepositRecord, DepositStatus, StkCallback};
use crate::repositories::mpesa::{normalize_phone, GatewayError, PaymentGateway};
use crate::repositories::Repositories;

/// A pending deposit blocks new ones for this long.
pub const DEPOSIT_COOLDOWN_HOURS: i64 = 24;

/// `(threshold, reward)` pairs, highest threshold first.
pub const REFERRAL_REWARDS: [(i64, i64); 5] = [
    (10_000, 1_000),
    (5_000, 500),
    (2_000, 200),
    (1_000, 100),
    (500, 50),
];

const DARAJA_SUCCESS: i64 = 0;

pub fn referral_reward(amount: i64) -> Option<i64> {
    REFERRAL_REWARDS
        .iter()
        .find(|(threshold, _)| amount >= *threshold)
        .map(|(_, reward)| *reward)
}

pub enum DepositServiceRequest {
    NewDeposit {
        account_id: String,
        amount: i64,
        phone: String,
        response: oneshot::Sender<Result<DepositRecord, ServiceError>>,
    },
    Confirm {
        deposit_id: String,
        response: oneshot::Sender<Result<DepositRecord, ServiceError>>,
    },
    Fail {
        deposit_id: String,
        reason: String,
        response: oneshot::Sender<Result<DepositRecord, ServiceError>>,
    },
    GatewayCallback {
        callback: StkCallback,
        response: oneshot::Sender<Result<DepositRecord, ServiceError>>,
    },
    ListDeposits {
        account_id: String,
        response: oneshot::Sender<Result<Vec<DepositRecord>, ServiceError>>,
    },
    ListPending {
        response: oneshot::Sender<Result<Vec<DepositRecord>, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct DepositRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
    gateway: Option<Arc<dyn PaymentGateway>>,
    gateway_timeout: Duration,
    notifier: Notifier,
}

impl DepositRequestHandler {
    pub fn new(
        repositories: Repositories,
        locks: KeyedLocks,
        gateway: Option<Arc<dyn PaymentGateway>>,
        gateway_timeout: Duration,
        notifier: Notifier,
    ) -> Self {
        DepositRequestHandler {
            repositories,
            locks,
            gateway,
            gateway_timeout,
            notifier,
        }
    }

    pub async fn request_deposit(
        &self,
        account_id: &str,
        amount: i64,
        phone: &str,
    ) -> Result<DepositRecord, ServiceError> {
        self.request_deposit_at(account_id, amount, phone, Utc::now())
            .await
    }

    pub(crate) async fn request_deposit_at(
        &self,
        account_id: &str,
        amount: i64,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<DepositRecord, ServiceError> {
        if amount <= 0 {
            return Err(ServiceError::Validation(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if phone.trim().is_empty() {
            return Err(ServiceError::Validation("phone is required".to_string()));
        }
        let phone = normalize_phone(phone)
            .ok_or_else(|| ServiceError::Validation(format!("invalid phone: {}", phone)))?;

        let deposit = {
            let _guard = self.locks.lock_account(account_id).await;
            let mut account = self
                .repositories
                .accounts
                .get(account_id)
                .await
                .map_err(ServiceError::repository("Deposits"))?
                .ok_or_else(|| ServiceError::NotFound(format!("account {}", account_id)))?;

            let within_cooldown = account
                .last_deposit_attempt
                .map(|last| now - last < chrono::Duration::hours(DEPOSIT_COOLDOWN_HOURS))
                .unwrap_or(false);
            if within_cooldown && self.has_pending(account_id).await? {
                log::debug!("Account {} already has a pending deposit.", account_id);
                return Err(ServiceError::DuplicatePending);
            }

            let mut deposit = DepositRecord::pending(
                Uuid::new_v4().hyphenated().to_string(),
                account.id.clone(),
                amount,
                phone,
            );
            deposit.created_at = now;
            account.last_deposit_attempt = Some(now);

            self.repositories
                .ledger
                .commit_deposit(&deposit, &account)
                .await
                .map_err(ServiceError::repository("Deposits"))?;

            deposit
        };

        log::info!(
            "Deposit {} of {} created for account {}.",
            deposit.id,
            deposit.amount,
            deposit.account_id
        );
        self.notifier.notify(Notification::DepositRequested {
            deposit_id: deposit.id.clone(),
            account_id: deposit.account_id.clone(),
            amount: deposit.amount,
            phone: deposit.phone.clone(),
        });

        // The deposit stays pending whatever the gateway does; a failed push
        // falls back to manual confirmation.
        match self.start_push(&deposit).await {
            Ok(gateway_ref) => self.attach_gateway_ref(&deposit, gateway_ref).await,
            Err(e) => {
                log::warn!(
                    "Deposit {} left for manual confirmation: {}",
                    deposit.id,
                    e
                );
                Ok(deposit)
            }
        }
    }

    async fn has_pending(&self, account_id: &str) -> Result<bool, ServiceError> {
        let deposits = self
            .repositories
            .deposits
            .list_by_account(account_id)
            .await
            .map_err(ServiceError::repository("Deposits"))?;

        Ok(deposits
            .iter()
            .any(|d| d.status == DepositStatus::Pending))
    }

    async fn start_push(&self, deposit: &DepositRecord) -> Result<String, ServiceError> {
        let gateway = self.gateway.as_ref().ok_or_else(|| {
            ServiceError::GatewayUnavailable("no payment gateway configured".to_string())
        })?;
        let reference: String = deposit.id.chars().filter(|c| *c != '-').take(12).collect();

        match tokio::time::timeout(
            self.gateway_timeout,
            gateway.request_push(&deposit.phone, deposit.amount, &reference),
        )
        .await
        {
            Ok(Ok(gateway_ref)) => Ok(gateway_ref),
            Ok(Err(e)) => Err(ServiceError::GatewayUnavailable(e.to_string())),
            Err(_) => Err(ServiceError::GatewayUnavailable(
                GatewayError::Timeout(self.gateway_timeout.as_secs()).to_string(),
            )),
        }
    }

    /// Stores the gateway reference, then applies a result that was
    /// delivered before the reference was known.
    async fn attach_gateway_ref(
        &self,
        deposit: &DepositRecord,
        gateway_ref: String,
    ) -> Result<DepositRecord, ServiceError> {
        let current = {
            let _guard = self.locks.lock_account(&deposit.account_id).await;
            let mut current = self.load(&deposit.id).await?;
            current.gateway_ref = Some(gateway_ref.clone());

            self.repositories
                .deposits
                .put(&current)
                .await
                .map_err(ServiceError::repository("Deposits"))?;
            current
        };
        log::info!("Deposit {} pushed to gateway as {}.", current.id, gateway_ref);

        let parked = {
            let _guard = self.locks.lock_callback(&gateway_ref).await;
            self.repositories
                .deposits
                .take_parked_callback(&gateway_ref)
                .await
                .map_err(ServiceError::repository("Deposits"))?
        };

        match parked {
            Some(callback) => {
                log::info!(
                    "Applying early callback {} to deposit {}.",
                    gateway_ref,
                    current.id
                );
                self.apply_callback(&current.id, &callback).await
            }
            None => Ok(current),
        }
    }

    async fn load(&self, deposit_id: &str) -> Result<DepositRecord, ServiceError> {
        self.repositories
            .deposits
            .get(deposit_id)
            .await
            .map_err(ServiceError::repository("Deposits"))?
            .ok_or_else(|| ServiceError::NotFound(format!("deposit {}", deposit_id)))
    }

    /// Credits the deposit to its account. Only the first confirmation has
    /// an effect; later ones report `AlreadyProcessed`.
    pub async fn confirm_deposit(&self, deposit_id: &str) -> Result<DepositRecord, ServiceError> {
        let owner = self.load(deposit_id).await?.account_id;

        let (deposit, referred_by) = {
            let _guard = self.locks.lock_account(&owner).await;
            let mut deposit = self.load(deposit_id).await?;
            if deposit.status.is_terminal() {
                return Err(ServiceError::AlreadyProcessed);
            }

            let mut account = self
                .repositories
                .accounts
                .get(&deposit.account_id)
                .await
                .map_err(ServiceError::repository("Deposits"))?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("account {}", deposit.account_id))
                })?;

            account.credit_balance(deposit.amount)?;
            account.deposit_phone = Some(deposit.phone.clone());
            deposit.status = DepositStatus::Confirmed;
            deposit.confirmed_at = Some(Utc::now());

            self.repositories
                .ledger
                .commit_deposit(&deposit, &account)
                .await
                .map_err(ServiceError::repository("Deposits"))?;

            (deposit, account.referred_by)
        };

        log::info!(
            "Deposit {} confirmed: {} credited to {}.",
            deposit.id,
            deposit.amount,
            deposit.account_id
        );
        self.notifier.notify(Notification::DepositConfirmed {
            deposit_id: deposit.id.clone(),
            account_id: deposit.account_id.clone(),
            amount: deposit.amount,
        });

        if let Some(code) = referred_by {
            match self
                .reward_referrer(&code, deposit.amount, &deposit.account_id)
                .await
            {
                Ok(Some((referrer, reward))) => {
                    log::info!(
                        "Referral reward of {} credited to {} for deposit {}.",
                        reward,
                        referrer,
                        deposit.id
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Referral reward for deposit {} failed: {}", deposit.id, e);
                }
            }
        }

        Ok(deposit)
    }

    async fn reward_referrer(
        &self,
        referral_code: &str,
        amount: i64,
        depositor_id: &str,
    ) -> Result<Option<(String, i64)>, ServiceError> {
        let reward = match referral_reward(amount) {
            Some(reward) => reward,
            None => return Ok(None),
        };

        let referrer = self
            .repositories
            .accounts
            .find_by_referral_code(referral_code)
            .await
            .map_err(ServiceError::repository("Deposits"))?;
        let referrer_id = match referrer {
            Some(referrer) if referrer.id != depositor_id => referrer.id,
            _ => return Ok(None),
        };

        let _guard = self.locks.lock_account(&referrer_id).await;
        let mut referrer = self
            .repositories
            .accounts
            .get(&referrer_id)
            .await
            .map_err(ServiceError::repository("Deposits"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", referrer_id)))?;

        referrer.credit_balance(reward)?;
        self.repositories
            .accounts
            .put(&referrer)
            .await
            .map_err(ServiceError::repository("Deposits"))?;

        Ok(Some((referrer_id, reward)))
    }

    pub async fn fail_deposit(
        &self,
        deposit_id: &str,
        reason: &str,
    ) -> Result<DepositRecord, ServiceError> {
        let owner = self.load(deposit_id).await?.account_id;

        let _guard = self.locks.lock_account(&owner).await;
        let mut deposit = self.load(deposit_id).await?;
        if deposit.status.is_terminal() {
            return Err(ServiceError::AlreadyProcessed);
        }

        deposit.status = DepositStatus::Failed;
        deposit.failed_at = Some(Utc::now());
        deposit.failure_reason = Some(reason.to_string());
        self.repositories
            .deposits
            .put(&deposit)
            .await
            .map_err(ServiceError::repository("Deposits"))?;

        log::info!("Deposit {} failed: {}", deposit.id, reason);
        Ok(deposit)
    }

    /// Applies a gateway result. Duplicate or late deliveries for a record
    /// that is already terminal are acknowledged without effect. A result for
    /// a reference no deposit carries yet is parked and reported as
    /// `NotFound`; it is applied once the reference is attached.
    pub async fn handle_callback(
        &self,
        callback: &StkCallback,
    ) -> Result<DepositRecord, ServiceError> {
        let gateway_ref = &callback.checkout_request_id;

        let deposit = {
            let _guard = self.locks.lock_callback(gateway_ref).await;
            let found = self
                .repositories
                .deposits
                .find_by_gateway_ref(gateway_ref)
                .await
                .map_err(ServiceError::repository("Deposits"))?;

            match found {
                Some(deposit) => deposit,
                None => {
                    self.repositories
                        .deposits
                        .park_callback(callback)
                        .await
                        .map_err(ServiceError::repository("Deposits"))?;
                    log::warn!("Parked callback {} with no matching deposit.", gateway_ref);
                    return Err(ServiceError::NotFound(format!("gateway ref {}", gateway_ref)));
                }
            }
        };

        self.apply_callback(&deposit.id, callback).await
    }

    async fn apply_callback(
        &self,
        deposit_id: &str,
        callback: &StkCallback,
    ) -> Result<DepositRecord, ServiceError> {
        let result = if callback.result_code == DARAJA_SUCCESS {
            self.confirm_deposit(deposit_id).await
        } else {
            let reason = callback
                .result_desc
                .clone()
                .unwrap_or_else(|| format!("result code {}", callback.result_code));
            self.fail_deposit(deposit_id, &reason).await
        };

        match result {
            Err(ServiceError::AlreadyProcessed) => {
                log::debug!(
                    "Ignoring repeated callback {} for deposit {}.",
                    callback.checkout_request_id,
                    deposit_id
                );
                self.load(deposit_id).await
            }
            other => other,
        }
    }

    pub async fn list_deposits(&self, account_id: &str) -> Result<Vec<DepositRecord>, ServiceError> {
        self.repositories
            .deposits
            .list_by_account(account_id)
            .await
            .map_err(ServiceError::repository("Deposits"))
    }

    /// Deposits still waiting for a gateway result or an admin decision.
    pub async fn list_pending(&self) -> Result<Vec<DepositRecord>, ServiceError> {
        self.repositories
            .deposits
            .list_by_status(DepositStatus::Pending)
            .await
            .map_err(ServiceError::repository("Deposits"))
    }
}

#[async_trait]
impl RequestHandler<DepositServiceRequest> for DepositRequestHandler {
    async fn handle_request(&self, request: DepositServiceRequest) {
        match request {
            DepositServiceRequest::NewDeposit {
                account_id,
                amount,
                phone,
                response,
            } => {
                let result = self.request_deposit(&account_id, amount, &phone).await;
                let _ = response.send(result);
            }
            DepositServiceRequest::Confirm {
                deposit_id,
                response,
            } => {
                let _ = response.send(self.confirm_deposit(&deposit_id).await);
            }
            DepositServiceRequest::Fail {
                deposit_id,
                reason,
                response,
            } => {
                let _ = response.send(self.fail_deposit(&deposit_id, &reason).await);
            }
            DepositServiceRequest::GatewayCallback { callback, response } => {
                let _ = response.send(self.handle_callback(&callback).await);
            }
            DepositServiceRequest::ListDeposits {
                account_id,
                response,
            } => {
                let _ = response.send(self.list_deposits(&account_id).await);
            }
            DepositServiceRequest::ListPending { response } => {
                let _ = response.send(self.list_pending().await);
            }
        }
    }
}

pub struct DepositService;

impl DepositService {
    pub fn new() -> Self {
        DepositService {}
    }
}

#[async_trait]
impl Service<DepositServiceRequest, DepositRequestHandler> for DepositService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::accounts::Account;
    use crate::repositories::memory::{FlakyLedger, MemoryStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeGateway {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn request_push(
            &self,
            _phone: &str,
            _amount: i64,
            _reference: &str,
        ) -> Result<String, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(GatewayError::BadResponse("down".to_string()))
            } else {
                Ok(format!("ws_CO_{}", n))
            }
        }
    }

    fn gateway(fail: bool, delay: Duration) -> Arc<FakeGateway> {
        Arc::new(FakeGateway {
            calls: AtomicUsize::new(0),
            fail,
            delay,
        })
    }

    async fn setup(
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> (DepositRequestHandler, Repositories) {
        setup_with(Repositories::in_memory(), gateway).await
    }

    async fn setup_with(
        repositories: Repositories,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> (DepositRequestHandler, Repositories) {
        let referrer = Account::new(
            "referrer".to_string(),
            Some("r@example.com".to_string()),
            None,
            "hash".to_string(),
            "REFCODE1".to_string(),
            None,
        );
        let user = Account::new(
            "user".to_string(),
            Some("u@example.com".to_string()),
            Some("254712345678".to_string()),
            "hash".to_string(),
            "USERCODE".to_string(),
            Some("REFCODE1".to_string()),
        );
        repositories.accounts.put(&referrer).await.unwrap();
        repositories.accounts.put(&user).await.unwrap();

        let (notifier, _rx) = Notifier::channel(64);
        let handler = DepositRequestHandler::new(
            repositories.clone(),
            KeyedLocks::new(),
            gateway,
            Duration::from_millis(200),
            notifier,
        );
        (handler, repositories)
    }

    async fn balance(repositories: &Repositories, id: &str) -> i64 {
        repositories.accounts.get(id).await.unwrap().unwrap().balance
    }

    #[test]
    fn referral_table_picks_the_highest_matching_threshold() {
        assert_eq!(referral_reward(499), None);
        assert_eq!(referral_reward(500), Some(50));
        assert_eq!(referral_reward(1_000), Some(100));
        assert_eq!(referral_reward(4_999), Some(200));
        assert_eq!(referral_reward(50_000), Some(1_000));
    }

    #[tokio::test]
    async fn request_validates_input() {
        let (handler, _) = setup(None).await;

        assert!(matches!(
            handler.request_deposit("user", 0, "0712345678").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            handler.request_deposit("user", 100, "  ").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            handler.request_deposit("ghost", 100, "0712345678").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn gateway_reference_is_stored_on_the_pending_record() {
        let fake = gateway(false, Duration::ZERO);
        let (handler, repositories) = setup(Some(fake.clone())).await;

        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Pending);
        assert_eq!(deposit.gateway_ref.as_deref(), Some("ws_CO_0"));
        assert_eq!(deposit.phone, "254712345678");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        let stored = repositories.deposits.get(&deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.gateway_ref.as_deref(), Some("ws_CO_0"));
        assert_eq!(balance(&repositories, "user").await, 0);
    }

    #[tokio::test]
    async fn gateway_failure_and_timeout_leave_a_pending_deposit() {
        let (handler, _) = setup(Some(gateway(true, Duration::ZERO))).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Pending);
        assert!(deposit.gateway_ref.is_none());

        let (handler, repositories) = setup(Some(gateway(false, Duration::from_secs(5)))).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        assert!(deposit.gateway_ref.is_none());
        let stored = repositories.deposits.get(&deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn second_request_while_pending_is_throttled() {
        let (handler, _) = setup(None).await;
        let now = Utc::now();

        let first = handler
            .request_deposit_at("user", 1000, "0712345678", now)
            .await
            .unwrap();
        assert_eq!(
            handler
                .request_deposit_at("user", 500, "0712345678", now + chrono::Duration::hours(1))
                .await
                .unwrap_err(),
            ServiceError::DuplicatePending
        );

        // A stale pending record no longer blocks.
        let second = handler
            .request_deposit_at("user", 500, "0712345678", now + chrono::Duration::hours(25))
            .await
            .unwrap();

        // Once nothing is pending the cooldown does not apply.
        handler.confirm_deposit(&first.id).await.unwrap();
        handler.fail_deposit(&second.id, "expired").await.unwrap();
        handler
            .request_deposit_at("user", 700, "0712345678", now + chrono::Duration::hours(26))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn confirming_twice_credits_once_and_pays_the_referrer() {
        let (handler, repositories) = setup(None).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();

        let confirmed = handler.confirm_deposit(&deposit.id).await.unwrap();
        assert_eq!(confirmed.status, DepositStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(
            handler.confirm_deposit(&deposit.id).await.unwrap_err(),
            ServiceError::AlreadyProcessed
        );

        assert_eq!(balance(&repositories, "user").await, 1000);
        assert_eq!(balance(&repositories, "referrer").await, 100);
        let user = repositories.accounts.get("user").await.unwrap().unwrap();
        assert_eq!(user.deposit_phone.as_deref(), Some("254712345678"));
    }

    #[tokio::test]
    async fn small_deposits_earn_no_referral_reward() {
        let (handler, repositories) = setup(None).await;
        let deposit = handler
            .request_deposit("user", 300, "0712345678")
            .await
            .unwrap();
        handler.confirm_deposit(&deposit.id).await.unwrap();

        assert_eq!(balance(&repositories, "user").await, 300);
        assert_eq!(balance(&repositories, "referrer").await, 0);
    }

    #[tokio::test]
    async fn callbacks_confirm_fail_and_tolerate_duplicates() {
        let (handler, repositories) = setup(Some(gateway(false, Duration::ZERO))).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        let gateway_ref = deposit.gateway_ref.clone().unwrap();

        let success = StkCallback {
            merchant_request_id: None,
            checkout_request_id: gateway_ref.clone(),
            result_code: 0,
            result_desc: Some("The service request is processed successfully.".to_string()),
        };
        let failure = StkCallback {
            result_code: 1032,
            result_desc: Some("Request cancelled by user".to_string()),
            ..success.clone()
        };

        let confirmed = handler.handle_callback(&success).await.unwrap();
        assert_eq!(confirmed.status, DepositStatus::Confirmed);

        // Duplicate and out-of-order deliveries change nothing.
        let again = handler.handle_callback(&success).await.unwrap();
        assert_eq!(again.status, DepositStatus::Confirmed);
        let late_failure = handler.handle_callback(&failure).await.unwrap();
        assert_eq!(late_failure.status, DepositStatus::Confirmed);
        assert_eq!(balance(&repositories, "user").await, 1000);

        let unknown = StkCallback {
            checkout_request_id: "ws_CO_missing".to_string(),
            ..success
        };
        assert!(matches!(
            handler.handle_callback(&unknown).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_deposits_are_terminal() {
        let (handler, repositories) = setup(None).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();

        let failed = handler
            .fail_deposit(&deposit.id, "cancelled")
            .await
            .unwrap();
        assert_eq!(failed.status, DepositStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(
            handler.confirm_deposit(&deposit.id).await.unwrap_err(),
            ServiceError::AlreadyProcessed
        );
        assert_eq!(balance(&repositories, "user").await, 0);
        assert_eq!(handler.list_deposits("user").await.unwrap().len(), 1);
    }

    fn callback(gateway_ref: &str, result_code: i64) -> StkCallback {
        StkCallback {
            merchant_request_id: None,
            checkout_request_id: gateway_ref.to_string(),
            result_code,
            result_desc: None,
        }
    }

    #[tokio::test]
    async fn callback_arriving_before_the_reference_is_applied_on_attach() {
        let (handler, repositories) = setup(Some(gateway(false, Duration::ZERO))).await;

        // The fake gateway hands out ws_CO_0 for the first push.
        assert!(matches!(
            handler.handle_callback(&callback("ws_CO_0", 0)).await,
            Err(ServiceError::NotFound(_))
        ));

        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Confirmed);
        assert_eq!(deposit.gateway_ref.as_deref(), Some("ws_CO_0"));
        assert_eq!(balance(&repositories, "user").await, 1000);
        assert_eq!(balance(&repositories, "referrer").await, 100);
        assert!(repositories
            .deposits
            .take_parked_callback("ws_CO_0")
            .await
            .unwrap()
            .is_none());

        // A late duplicate of the same result is still harmless.
        let again = handler.handle_callback(&callback("ws_CO_0", 0)).await.unwrap();
        assert_eq!(again.status, DepositStatus::Confirmed);
        assert_eq!(balance(&repositories, "user").await, 1000);
    }

    #[tokio::test]
    async fn early_failure_callback_releases_the_pending_slot() {
        let (handler, repositories) = setup(Some(gateway(false, Duration::ZERO))).await;

        let _ = handler.handle_callback(&callback("ws_CO_0", 1032)).await;
        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Failed);
        assert_eq!(deposit.failure_reason.as_deref(), Some("result code 1032"));

        let next = handler
            .request_deposit("user", 500, "0712345678")
            .await
            .unwrap();
        assert_eq!(next.status, DepositStatus::Pending);
        assert_eq!(balance(&repositories, "user").await, 0);
    }

    #[tokio::test]
    async fn overflowing_credit_leaves_the_deposit_pending() {
        let (handler, repositories) = setup(None).await;
        let deposit = handler
            .request_deposit("user", 100, "0712345678")
            .await
            .unwrap();

        let mut user = repositories.accounts.get("user").await.unwrap().unwrap();
        user.balance = i64::MAX - 10;
        repositories.accounts.put(&user).await.unwrap();

        assert!(matches!(
            handler.confirm_deposit(&deposit.id).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(balance(&repositories, "user").await, i64::MAX - 10);
        let stored = repositories.deposits.get(&deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn failed_commit_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FlakyLedger {
            inner: store.clone(),
            failing: AtomicBool::new(false),
        });
        let mut repositories = Repositories::memory(store);
        repositories.ledger = ledger.clone();
        let (handler, repositories) = setup_with(repositories, None).await;

        let deposit = handler
            .request_deposit("user", 1000, "0712345678")
            .await
            .unwrap();

        ledger.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            handler.confirm_deposit(&deposit.id).await,
            Err(ServiceError::Repository(_, _))
        ));
        let stored = repositories.deposits.get(&deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Pending);
        assert_eq!(balance(&repositories, "user").await, 0);

        ledger.failing.store(false, Ordering::SeqCst);
        let confirmed = handler.confirm_deposit(&deposit.id).await.unwrap();
        assert_eq!(confirmed.status, DepositStatus::Confirmed);
        assert_eq!(balance(&repositories, "user").await, 1000);
    }

    #[tokio::test]
    async fn pending_list_excludes_settled_deposits() {
        let (handler, _) = setup(None).await;
        let now = Utc::now();
        let first = handler
            .request_deposit_at("user", 1000, "0712345678", now)
            .await
            .unwrap();
        handler.confirm_deposit(&first.id).await.unwrap();
        let second = handler
            .request_deposit_at("user", 600, "0712345678", now)
            .await
            .unwrap();

        let pending = handler.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }
}
