use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use tokio::sync::{oneshot, Mutex};

use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError};
use crate::models::accounts::{checked_credit, FridgeHolding, LedgerError};
use crate::models::jobs::{AccrualOutcome, DAILY_ACCRUAL};
use crate::repositories::Repositories;

/// Minimum spacing between two runs, regardless of how often the job is checked.
pub const MIN_HOURS_BETWEEN_RUNS: i64 = 20;
const MAX_CONCURRENT_ACCOUNTS: usize = 16;

pub enum AccrualServiceRequest {
    Run {
        response: oneshot::Sender<Result<AccrualOutcome, ServiceError>>,
    },
}

/// Credits due earnings on every holding and returns the total. Ordinary
/// fridges pay `daily_earn`; offer fridges pay their price once after the
/// window closes and ignore `daily_earn`.
pub fn accrue_holdings(
    holdings: &mut [FridgeHolding],
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let mut total = 0;

    for holding in holdings.iter_mut() {
        match holding.offer.as_mut() {
            None => total = checked_credit(total, holding.daily_earn.max(0))?,
            Some(window) if window.is_due(now) => {
                window.paid = true;
                total = checked_credit(total, holding.price)?;
            }
            Some(_) => {}
        }
    }

    Ok(total)
}

#[derive(Clone)]
pub struct AccrualRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
    run_lock: Arc<Mutex<()>>,
}

impl AccrualRequestHandler {
    pub fn new(repositories: Repositories, locks: KeyedLocks) -> Self {
        AccrualRequestHandler {
            repositories,
            locks,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn start_accrual_task(&self, check_interval: Duration) {
        let handler = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);

            loop {
                interval.tick().await;

                match handler.run_accrual(Utc::now()).await {
                    Ok(AccrualOutcome::Completed {
                        accounts_processed,
                        accounts_failed,
                        total_credited,
                    }) => {
                        log::info!(
                            "Daily accrual credited {} across {} accounts ({} failed).",
                            total_credited,
                            accounts_processed,
                            accounts_failed
                        );
                    }
                    Ok(AccrualOutcome::Skipped { last_run }) => {
                        log::debug!("Daily accrual skipped, last run at {}.", last_run);
                    }
                    Err(e) => {
                        log::error!("Error running daily accrual: {}", e);
                    }
                }
            }
        });

        log::info!("Accrual task started");
    }

    pub async fn run_accrual(&self, now: DateTime<Utc>) -> Result<AccrualOutcome, ServiceError> {
        let _run = self.run_lock.lock().await;

        let last_run = self
            .repositories
            .jobs
            .last_run(DAILY_ACCRUAL)
            .await
            .map_err(ServiceError::repository("Accrual"))?;
        if let Some(last_run) = last_run {
            if now - last_run < chrono::Duration::hours(MIN_HOURS_BETWEEN_RUNS) {
                return Ok(AccrualOutcome::Skipped { last_run });
            }
        }

        let accounts = self
            .repositories
            .accounts
            .scan()
            .await
            .map_err(ServiceError::repository("Accrual"))?;

        let results: Vec<(String, Result<i64, ServiceError>)> = stream::iter(accounts)
            .map(|account| async move {
                let result = self.accrue_account(&account.id, now).await;
                (account.id, result)
            })
            .buffer_unordered(MAX_CONCURRENT_ACCOUNTS)
            .collect()
            .await;

        let mut accounts_processed = 0;
        let mut accounts_failed = 0;
        let mut total_credited: i64 = 0;
        for (account_id, result) in results {
            match result {
                Ok(credited) => {
                    accounts_processed += 1;
                    total_credited = total_credited.saturating_add(credited);
                }
                Err(e) => {
                    accounts_failed += 1;
                    log::error!("Accrual failed for account {}: {}", account_id, e);
                }
            }
        }

        self.repositories
            .jobs
            .set_last_run(DAILY_ACCRUAL, now)
            .await
            .map_err(ServiceError::repository("Accrual"))?;

        Ok(AccrualOutcome::Completed {
            accounts_processed,
            accounts_failed,
            total_credited,
        })
    }

    async fn accrue_account(&self, account_id: &str, now: DateTime<Utc>) -> Result<i64, ServiceError> {
        let _guard = self.locks.lock_account(account_id).await;

        // Re-read under the lock; the scan snapshot may be stale.
        let mut account = self
            .repositories
            .accounts
            .get(account_id)
            .await
            .map_err(ServiceError::repository("Accrual"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", account_id)))?;

        let credited = accrue_holdings(&mut account.fridges, now)?;
        if credited == 0 {
            return Ok(0);
        }

        account.credit_earning(credited)?;
        self.repositories
            .accounts
            .put(&account)
            .await
            .map_err(ServiceError::repository("Accrual"))?;

        Ok(credited)
    }
}

#[async_trait]
impl RequestHandler<AccrualServiceRequest> for AccrualRequestHandler {
    async fn handle_request(&self, request: AccrualServiceRequest) {
        match request {
            AccrualServiceRequest::Run { response } => {
                let _ = response.send(self.run_accrual(Utc::now()).await);
            }
        }
    }
}

pub struct AccrualService;

impl AccrualService {
    pub fn new() -> Self {
        AccrualService {}
    }
}

#[async_trait]
impl Service<AccrualServiceRequest, AccrualRequestHandler> for AccrualService {}
