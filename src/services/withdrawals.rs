use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::notifications::{Notification, Notifier};
use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError, WithdrawalPolicy};
use crate::models::withdrawals::{WithdrawalRequest, WithdrawalStatus};
use crate::repositories::{mpesa::normalize_phone, Repositories};

pub const WITHDRAWAL_COOLDOWN_HOURS: i64 = 24;

pub enum WithdrawalServiceRequest {
    NewWithdrawal {
        account_id: String,
        amount: i64,
        phone: String,
        response: oneshot::Sender<Result<WithdrawalRequest, ServiceError>>,
    },
    Approve {
        withdrawal_id: String,
        response: oneshot::Sender<Result<WithdrawalRequest, ServiceError>>,
    },
    Reject {
        withdrawal_id: String,
        reason: String,
        response: oneshot::Sender<Result<WithdrawalRequest, ServiceError>>,
    },
    ListWithdrawals {
        account_id: String,
        response: oneshot::Sender<Result<Vec<WithdrawalRequest>, ServiceError>>,
    },
    ListPending {
        response: oneshot::Sender<Result<Vec<WithdrawalRequest>, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct WithdrawalRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
    policy: WithdrawalPolicy,
    notifier: Notifier,
}

impl WithdrawalRequestHandler {
    pub fn new(
        repositories: Repositories,
        locks: KeyedLocks,
        policy: WithdrawalPolicy,
        notifier: Notifier,
    ) -> Self {
        WithdrawalRequestHandler {
            repositories,
            locks,
            policy,
            notifier,
        }
    }

    pub async fn request_withdrawal(
        &self,
        account_id: &str,
        amount: i64,
        phone: &str,
    ) -> Result<WithdrawalRequest, ServiceError> {
        self.request_withdrawal_at(account_id, amount, phone, Utc::now())
            .await
    }

    /// Checks run in a fixed order and the first failure is reported:
    /// minimum amount, cooldown, phone, weekday, funds.
    pub(crate) async fn request_withdrawal_at(
        &self,
        account_id: &str,
        amount: i64,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, ServiceError> {
        if amount < self.policy.minimum {
            return Err(ServiceError::Validation(format!(
                "minimum withdrawal is {}",
                self.policy.minimum
            )));
        }

        let _guard = self.locks.lock_account(account_id).await;
        let mut account = self
            .repositories
            .accounts
            .get(account_id)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", account_id)))?;

        let within_cooldown = account
            .last_withdrawal_attempt
            .map(|last| now - last < chrono::Duration::hours(WITHDRAWAL_COOLDOWN_HOURS))
            .unwrap_or(false);
        if within_cooldown && self.has_pending(account_id).await? {
            log::debug!("Account {} already has a pending withdrawal.", account_id);
            return Err(ServiceError::DuplicatePending);
        }

        let phone = match normalize_phone(phone) {
            Some(phone) if account.owns_phone(&phone) => phone,
            _ => return Err(ServiceError::Validation("phone mismatch".to_string())),
        };

        let weekday = now.weekday();
        if !self.policy.allowed_days.contains(&weekday) {
            return Err(ServiceError::Validation(format!(
                "withdrawals are not available on {}",
                weekday
            )));
        }

        if account.earning < amount {
            return Err(ServiceError::InsufficientFunds);
        }

        let mut withdrawal = WithdrawalRequest::pending(
            Uuid::new_v4().hyphenated().to_string(),
            account.id.clone(),
            amount,
            phone,
        );
        withdrawal.created_at = now;
        account.last_withdrawal_attempt = Some(now);

        self.repositories
            .ledger
            .commit_withdrawal(&withdrawal, &account)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?;

        log::info!(
            "Withdrawal {} of {} requested by account {}.",
            withdrawal.id,
            withdrawal.amount,
            withdrawal.account_id
        );
        self.notifier.notify(Notification::WithdrawalRequested {
            withdrawal_id: withdrawal.id.clone(),
            account_id: withdrawal.account_id.clone(),
            amount: withdrawal.amount,
            phone: withdrawal.phone.clone(),
        });

        Ok(withdrawal)
    }

    async fn has_pending(&self, account_id: &str) -> Result<bool, ServiceError> {
        let withdrawals = self
            .repositories
            .withdrawals
            .list_by_account(account_id)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?;

        Ok(withdrawals
            .iter()
            .any(|w| w.status == WithdrawalStatus::Pending))
    }

    async fn load(&self, withdrawal_id: &str) -> Result<WithdrawalRequest, ServiceError> {
        self.repositories
            .withdrawals
            .get(withdrawal_id)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))
    }

    /// Debits the account's earning. Funds are re-checked here since nothing
    /// was reserved when the request was made.
    pub async fn approve_withdrawal(
        &self,
        withdrawal_id: &str,
    ) -> Result<WithdrawalRequest, ServiceError> {
        let owner = self.load(withdrawal_id).await?.account_id;

        let _guard = self.locks.lock_account(&owner).await;
        let mut withdrawal = self.load(withdrawal_id).await?;
        if withdrawal.status.is_terminal() {
            return Err(ServiceError::AlreadyProcessed);
        }

        let mut account = self
            .repositories
            .accounts
            .get(&withdrawal.account_id)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("account {}", withdrawal.account_id))
            })?;

        account.debit_earning(withdrawal.amount)?;
        withdrawal.status = WithdrawalStatus::Approved;
        withdrawal.processed_at = Some(Utc::now());

        self.repositories
            .ledger
            .commit_withdrawal(&withdrawal, &account)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?;

        log::info!(
            "Withdrawal {} approved: {} debited from {}.",
            withdrawal.id,
            withdrawal.amount,
            withdrawal.account_id
        );
        self.notifier.notify(Notification::WithdrawalProcessed {
            withdrawal_id: withdrawal.id.clone(),
            status: withdrawal.status.to_string(),
        });

        Ok(withdrawal)
    }

    pub async fn reject_withdrawal(
        &self,
        withdrawal_id: &str,
        reason: &str,
    ) -> Result<WithdrawalRequest, ServiceError> {
        let owner = self.load(withdrawal_id).await?.account_id;

        let _guard = self.locks.lock_account(&owner).await;
        let mut withdrawal = self.load(withdrawal_id).await?;
        if withdrawal.status.is_terminal() {
            return Err(ServiceError::AlreadyProcessed);
        }

        withdrawal.status = WithdrawalStatus::Rejected;
        withdrawal.processed_at = Some(Utc::now());
        withdrawal.reason = Some(reason.to_string());
        self.repositories
            .withdrawals
            .put(&withdrawal)
            .await
            .map_err(ServiceError::repository("Withdrawals"))?;

        log::info!("Withdrawal {} rejected: {}", withdrawal.id, reason);
        self.notifier.notify(Notification::WithdrawalProcessed {
            withdrawal_id: withdrawal.id.clone(),
            status: withdrawal.status.to_string(),
        });

        Ok(withdrawal)
    }

    pub async fn list_withdrawals(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawalRequest>, ServiceError> {
        self.repositories
            .withdrawals
            .list_by_account(account_id)
            .await
            .map_err(ServiceError::repository("Withdrawals"))
    }

    pub async fn list_pending(&self) -> Result<Vec<WithdrawalRequest>, ServiceError> {
        self.repositories
            .withdrawals
            .list_by_status(WithdrawalStatus::Pending)
            .await
            .map_err(ServiceError::repository("Withdrawals"))
    }
}

#[async_trait]
impl RequestHandler<WithdrawalServiceRequest> for WithdrawalRequestHandler {
    async fn handle_request(&self, request: WithdrawalServiceRequest) {
        match request {
            WithdrawalServiceRequest::NewWithdrawal {
                account_id,
                amount,
                phone,
                response,
            } => {
                let result = self.request_withdrawal(&account_id, amount, &phone).await;
                let _ = response.send(result);
            }
            WithdrawalServiceRequest::Approve {
                withdrawal_id,
                response,
            } => {
                let _ = response.send(self.approve_withdrawal(&withdrawal_id).await);
            }
            WithdrawalServiceRequest::Reject {
                withdrawal_id,
                reason,
                response,
            } => {
                let _ = response.send(self.reject_withdrawal(&withdrawal_id, &reason).await);
            }
            WithdrawalServiceRequest::ListWithdrawals {
                account_id,
                response,
            } => {
                let _ = response.send(self.list_withdrawals(&account_id).await);
            }
            WithdrawalServiceRequest::ListPending { response } => {
                let _ = response.send(self.list_pending().await);
            }
        }
    }
}

pub struct WithdrawalService;

impl WithdrawalService {
    pub fn new() -> Self {
        WithdrawalService {}
    }
}

#[async_trait]
impl Service<WithdrawalServiceRequest, WithdrawalRequestHandler> for WithdrawalService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::accounts::Account;
    use crate::repositories::memory::{FlakyLedger, MemoryStore};
    use chrono::{TimeZone, Weekday};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const ALL_DAYS: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    async fn setup(
        earning: i64,
        allowed_days: Vec<Weekday>,
    ) -> (WithdrawalRequestHandler, Repositories) {
        setup_with(Repositories::in_memory(), earning, allowed_days).await
    }

    async fn setup_with(
        repositories: Repositories,
        earning: i64,
        allowed_days: Vec<Weekday>,
    ) -> (WithdrawalRequestHandler, Repositories) {
        let mut account = Account::new(
            "user".to_string(),
            Some("u@example.com".to_string()),
            Some("254712345678".to_string()),
            "hash".to_string(),
            "USERCODE".to_string(),
            None,
        );
        account.earning = earning;
        repositories.accounts.put(&account).await.unwrap();

        let (notifier, _rx) = Notifier::channel(64);
        let handler = WithdrawalRequestHandler::new(
            repositories.clone(),
            KeyedLocks::new(),
            WithdrawalPolicy {
                minimum: 200,
                allowed_days,
            },
            notifier,
        );
        (handler, repositories)
    }

    async fn earning(repositories: &Repositories) -> i64 {
        repositories.accounts.get("user").await.unwrap().unwrap().earning
    }

    #[tokio::test]
    async fn phone_mismatch_is_rejected_without_touching_earning() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;

        let err = handler
            .request_withdrawal("user", 500, "0799999999")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::Validation("phone mismatch".to_string()));
        assert_eq!(earning(&repositories).await, 1000);
    }

    #[tokio::test]
    async fn checks_are_reported_in_order() {
        // Monday.
        let monday = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let (handler, _) = setup(100, vec![Weekday::Tue]).await;

        // Below minimum wins over everything else.
        assert_eq!(
            handler
                .request_withdrawal_at("user", 100, "0799999999", monday)
                .await
                .unwrap_err(),
            ServiceError::Validation("minimum withdrawal is 200".to_string())
        );
        // Phone before weekday.
        assert_eq!(
            handler
                .request_withdrawal_at("user", 500, "0799999999", monday)
                .await
                .unwrap_err(),
            ServiceError::Validation("phone mismatch".to_string())
        );
        // Weekday before funds.
        assert!(matches!(
            handler
                .request_withdrawal_at("user", 500, "0712345678", monday)
                .await,
            Err(ServiceError::Validation(msg)) if msg.contains("Mon")
        ));
        // Funds last.
        let tuesday = monday + chrono::Duration::days(1);
        assert_eq!(
            handler
                .request_withdrawal_at("user", 500, "0712345678", tuesday)
                .await
                .unwrap_err(),
            ServiceError::InsufficientFunds
        );
    }

    #[tokio::test]
    async fn request_does_not_debit_and_blocks_a_second_request() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;
        let now = Utc::now();

        let withdrawal = handler
            .request_withdrawal_at("user", 500, "+254712345678", now)
            .await
            .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Pending);
        assert_eq!(earning(&repositories).await, 1000);

        assert_eq!(
            handler
                .request_withdrawal_at("user", 300, "0712345678", now + chrono::Duration::hours(2))
                .await
                .unwrap_err(),
            ServiceError::DuplicatePending
        );
        assert_eq!(handler.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn approve_is_exactly_once() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;
        let withdrawal = handler
            .request_withdrawal("user", 400, "0712345678")
            .await
            .unwrap();

        let approved = handler.approve_withdrawal(&withdrawal.id).await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Approved);
        assert!(approved.processed_at.is_some());
        assert_eq!(earning(&repositories).await, 600);

        assert_eq!(
            handler.approve_withdrawal(&withdrawal.id).await.unwrap_err(),
            ServiceError::AlreadyProcessed
        );
        assert_eq!(
            handler
                .reject_withdrawal(&withdrawal.id, "late")
                .await
                .unwrap_err(),
            ServiceError::AlreadyProcessed
        );
        assert_eq!(earning(&repositories).await, 600);
        assert!(handler.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_is_exactly_once_and_never_debits() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;
        let withdrawal = handler
            .request_withdrawal("user", 400, "0712345678")
            .await
            .unwrap();

        let rejected = handler
            .reject_withdrawal(&withdrawal.id, "suspicious")
            .await
            .unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("suspicious"));
        assert_eq!(
            handler
                .reject_withdrawal(&withdrawal.id, "again")
                .await
                .unwrap_err(),
            ServiceError::AlreadyProcessed
        );
        assert_eq!(earning(&repositories).await, 1000);
    }

    #[tokio::test]
    async fn approval_rechecks_funds() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;
        let withdrawal = handler
            .request_withdrawal("user", 800, "0712345678")
            .await
            .unwrap();

        let mut account = repositories.accounts.get("user").await.unwrap().unwrap();
        account.earning = 300;
        repositories.accounts.put(&account).await.unwrap();

        assert_eq!(
            handler.approve_withdrawal(&withdrawal.id).await.unwrap_err(),
            ServiceError::InsufficientFunds
        );
        assert_eq!(earning(&repositories).await, 300);
        let stored = repositories
            .withdrawals
            .get(&withdrawal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Pending);
    }

    #[tokio::test]
    async fn payout_to_last_deposit_phone_is_allowed() {
        let (handler, repositories) = setup(1000, ALL_DAYS.to_vec()).await;
        let mut account = repositories.accounts.get("user").await.unwrap().unwrap();
        account.deposit_phone = Some("254700000001".to_string());
        repositories.accounts.put(&account).await.unwrap();

        let withdrawal = handler
            .request_withdrawal("user", 300, "0700000001")
            .await
            .unwrap();
        assert_eq!(withdrawal.phone, "254700000001");
    }

    #[tokio::test]
    async fn failed_approval_commit_leaves_the_request_pending() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FlakyLedger {
            inner: store.clone(),
            failing: AtomicBool::new(false),
        });
        let mut repositories = Repositories::memory(store);
        repositories.ledger = ledger.clone();
        let (handler, repositories) = setup_with(repositories, 1000, ALL_DAYS.to_vec()).await;

        let withdrawal = handler
            .request_withdrawal("user", 400, "0712345678")
            .await
            .unwrap();

        ledger.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            handler.approve_withdrawal(&withdrawal.id).await,
            Err(ServiceError::Repository(_, _))
        ));
        let stored = repositories
            .withdrawals
            .get(&withdrawal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Pending);
        assert_eq!(earning(&repositories).await, 1000);

        ledger.failing.store(false, Ordering::SeqCst);
        let approved = handler.approve_withdrawal(&withdrawal.id).await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Approved);
        assert_eq!(earning(&repositories).await, 600);
    }
}
