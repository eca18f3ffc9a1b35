use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Utc, Weekday};

use bitfreeze::models::{
    accounts::{Account, NewAccount},
    deposits::{DepositStatus, StkCallback},
    jobs::AccrualOutcome,
};
use bitfreeze::repositories::{
    catalog::Catalog,
    mpesa::{GatewayError, PaymentGateway},
    Repositories,
};
use bitfreeze::services::{
    notifications::Notifier, Handlers, ServiceError, WithdrawalPolicy,
};

struct EchoGateway;

#[async_trait]
impl PaymentGateway for EchoGateway {
    async fn request_push(
        &self,
        _phone: &str,
        _amount: i64,
        reference: &str,
    ) -> Result<String, GatewayError> {
        Ok(format!("ws_CO_{}", reference))
    }
}

fn every_day() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
}

fn handlers(repositories: &Repositories, gateway: Option<Arc<dyn PaymentGateway>>) -> Handlers {
    let (notifier, _rx) = Notifier::channel(16);
    Handlers::new(
        repositories.clone(),
        Catalog::default(),
        gateway,
        Duration::from_secs(1),
        WithdrawalPolicy {
            minimum: 10,
            allowed_days: every_day(),
        },
        notifier,
    )
}

fn signup(phone: &str, referral_code: Option<String>) -> NewAccount {
    NewAccount {
        email: None,
        phone: Some(phone.to_string()),
        password: "fridge-pass".to_string(),
        referral_code,
    }
}

async fn reload(repositories: &Repositories, id: &str) -> Account {
    repositories.accounts.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn deposit_purchase_accrual_and_withdrawal() {
    let repositories = Repositories::in_memory();
    let handlers = handlers(&repositories, None);

    let referrer = handlers
        .accounts
        .register(signup("0711111111", None))
        .await
        .unwrap();
    let user = handlers
        .accounts
        .register(signup("0722222222", Some(referrer.referral_code.clone())))
        .await
        .unwrap();

    let deposit = handlers
        .deposits
        .request_deposit(&user.id, 1000, "0722222222")
        .await
        .unwrap();
    assert_eq!(deposit.status, DepositStatus::Pending);
    assert!(deposit.gateway_ref.is_none());

    handlers.deposits.confirm_deposit(&deposit.id).await.unwrap();
    assert_eq!(reload(&repositories, &user.id).await.balance, 1000);
    assert_eq!(reload(&repositories, &referrer.id).await.balance, 100);

    assert_eq!(
        handlers.deposits.confirm_deposit(&deposit.id).await.unwrap_err(),
        ServiceError::AlreadyProcessed
    );
    assert_eq!(reload(&repositories, &user.id).await.balance, 1000);
    assert_eq!(reload(&repositories, &referrer.id).await.balance, 100);

    let account = handlers
        .catalog
        .buy_fridge(&user.id, "fridge-mini")
        .await
        .unwrap();
    assert_eq!(account.balance, 500);

    let now = Utc::now();
    let outcome = handlers.accrual.run_accrual(now).await.unwrap();
    assert!(matches!(
        outcome,
        AccrualOutcome::Completed {
            accounts_failed: 0,
            total_credited: 25,
            ..
        }
    ));
    assert_eq!(reload(&repositories, &user.id).await.earning, 25);

    let outcome = handlers
        .accrual
        .run_accrual(now + chrono::Duration::hours(5))
        .await
        .unwrap();
    assert_eq!(outcome, AccrualOutcome::Skipped { last_run: now });
    assert_eq!(reload(&repositories, &user.id).await.earning, 25);

    let withdrawal = handlers
        .withdrawals
        .request_withdrawal(&user.id, 20, "+254722222222")
        .await
        .unwrap();
    handlers
        .withdrawals
        .approve_withdrawal(&withdrawal.id)
        .await
        .unwrap();
    assert_eq!(reload(&repositories, &user.id).await.earning, 5);
}

#[tokio::test]
async fn gateway_callbacks_are_applied_once() {
    let repositories = Repositories::in_memory();
    let handlers = handlers(&repositories, Some(Arc::new(EchoGateway)));

    let user = handlers
        .accounts
        .register(signup("0733333333", None))
        .await
        .unwrap();
    let deposit = handlers
        .deposits
        .request_deposit(&user.id, 750, "0733333333")
        .await
        .unwrap();
    let gateway_ref = deposit.gateway_ref.clone().unwrap();

    let callback = StkCallback {
        merchant_request_id: None,
        checkout_request_id: gateway_ref.clone(),
        result_code: 0,
        result_desc: Some("The service request is processed successfully.".to_string()),
    };
    let first = handlers.deposits.handle_callback(&callback).await.unwrap();
    let second = handlers.deposits.handle_callback(&callback).await.unwrap();
    assert_eq!(first.status, DepositStatus::Confirmed);
    assert_eq!(second.status, DepositStatus::Confirmed);

    let failure = StkCallback {
        result_code: 1032,
        result_desc: Some("Request cancelled by user".to_string()),
        ..callback
    };
    let late = handlers.deposits.handle_callback(&failure).await.unwrap();
    assert_eq!(late.status, DepositStatus::Confirmed);

    assert_eq!(reload(&repositories, &user.id).await.balance, 750);
}

#[tokio::test]
async fn concurrent_confirm_and_approve_do_not_lose_updates() {
    let repositories = Repositories::in_memory();
    let handlers = handlers(&repositories, None);

    let user = handlers
        .accounts
        .register(signup("0744444444", None))
        .await
        .unwrap();
    let mut account = reload(&repositories, &user.id).await;
    account.earning = 1000;
    repositories.accounts.put(&account).await.unwrap();

    for round in 0..10 {
        let deposit = handlers
            .deposits
            .request_deposit(&user.id, 100, "0744444444")
            .await
            .unwrap();
        let withdrawal = handlers
            .withdrawals
            .request_withdrawal(&user.id, 50, "0744444444")
            .await
            .unwrap();

        let deposits = handlers.deposits.clone();
        let withdrawals = handlers.withdrawals.clone();
        let confirm = tokio::spawn(async move { deposits.confirm_deposit(&deposit.id).await });
        let approve =
            tokio::spawn(async move { withdrawals.approve_withdrawal(&withdrawal.id).await });
        confirm.await.unwrap().unwrap();
        approve.await.unwrap().unwrap();

        let account = reload(&repositories, &user.id).await;
        assert_eq!(account.balance, 100 * (round + 1));
        assert_eq!(account.earning, 1000 - 50 * (round + 1));
    }
}

#[tokio::test]
async fn offer_codes_credit_earning_once_per_account() {
    let repositories = Repositories::in_memory();
    let handlers = handlers(&repositories, None);

    let user = handlers
        .accounts
        .register(signup("0755555555", None))
        .await
        .unwrap();
    handlers.offers.create_offer("launch", 300).await.unwrap();

    handlers.offers.redeem_offer(&user.id, "LAUNCH").await.unwrap();
    assert_eq!(
        handlers
            .offers
            .redeem_offer(&user.id, "launch")
            .await
            .unwrap_err(),
        ServiceError::AlreadyProcessed
    );
    assert_eq!(reload(&repositories, &user.id).await.earning, 300);
}
