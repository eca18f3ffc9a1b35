use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RequestHandler, Service};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    DepositRequested {
        deposit_id: String,
        account_id: String,
        amount: i64,
        phone: String,
    },
    DepositConfirmed {
        deposit_id: String,
        account_id: String,
        amount: i64,
    },
    WithdrawalRequested {
        withdrawal_id: String,
        account_id: String,
        amount: i64,
        phone: String,
    },
    WithdrawalProcessed {
        withdrawal_id: String,
        status: String,
    },
}

/// Fire-and-forget sender for admin notifications. A full or closed channel
/// is logged and otherwise ignored.
#[derive(Clone)]
pub struct Notifier {
    channel: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { channel: tx }, rx)
    }

    pub fn notify(&self, notification: Notification) {
        if let Err(e) = self.channel.try_send(notification) {
            log::warn!("Dropped admin notification: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct NotificationHandler;

impl NotificationHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RequestHandler<Notification> for NotificationHandler {
    async fn handle_request(&self, request: Notification) {
        match request {
            Notification::DepositRequested {
                deposit_id,
                account_id,
                amount,
                phone,
            } => {
                log::info!(
                    target: "admin",
                    "New deposit {} from account {}: {} via {}.",
                    deposit_id,
                    account_id,
                    amount,
                    phone
                );
            }
            Notification::DepositConfirmed {
                deposit_id,
                account_id,
                amount,
            } => {
                log::info!(
                    target: "admin",
                    "Deposit {} confirmed: {} credited to {}.",
                    deposit_id,
                    amount,
                    account_id
                );
            }
            Notification::WithdrawalRequested {
                withdrawal_id,
                account_id,
                amount,
                phone,
            } => {
                log::info!(
                    target: "admin",
                    "Withdrawal {} awaiting approval: {} to {} for account {}.",
                    withdrawal_id,
                    amount,
                    phone,
                    account_id
                );
            }
            Notification::WithdrawalProcessed {
                withdrawal_id,
                status,
            } => {
                log::info!(target: "admin", "Withdrawal {} {}.", withdrawal_id, status);
            }
        }
    }
}

pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        NotificationService {}
    }
}

#[async_trait]
impl Service<Notification, NotificationHandler> for NotificationService {}
