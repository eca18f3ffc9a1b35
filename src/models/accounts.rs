use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },
    #[error("Crediting {amount} to {current} overflows")]
    Overflow { current: i64, amount: i64 },
}

/// Time-boxed payout window carried by fridges bought from an offer entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OfferWindow {
    pub start_time: DateTime<Utc>,
    pub duration_hours: i64,
    pub paid: bool,
}

impl OfferWindow {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.start_time + Duration::hours(self.duration_hours)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paid && now >= self.ends_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FridgeHolding {
    pub product_id: String,
    pub name: String,
    pub price: i64,
    pub daily_earn: i64,
    pub acquired_at: DateTime<Utc>,
    pub offer: Option<OfferWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Account {
    pub id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub balance: i64,
    pub earning: i64,
    pub fridges: Vec<FridgeHolding>,
    pub referral_code: String,
    pub referred_by: Option<String>,
    pub deposit_phone: Option<String>,
    pub last_deposit_attempt: Option<DateTime<Utc>>,
    pub last_withdrawal_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        id: String,
        email: Option<String>,
        phone: Option<String>,
        password_hash: String,
        referral_code: String,
        referred_by: Option<String>,
    ) -> Self {
        Self {
            id,
            email,
            phone,
            password_hash,
            api_token: None,
            balance: 0,
            earning: 0,
            fridges: Vec::new(),
            referral_code,
            referred_by,
            deposit_phone: None,
            last_deposit_attempt: None,
            last_withdrawal_attempt: None,
            created_at: Utc::now(),
        }
    }

    pub fn credit_balance(&mut self, amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.balance = checked_credit(self.balance, amount)?;
        Ok(())
    }

    pub fn debit_balance(&mut self, amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    pub fn credit_earning(&mut self, amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        self.earning = checked_credit(self.earning, amount)?;
        Ok(())
    }

    pub fn debit_earning(&mut self, amount: i64) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if self.earning < amount {
            return Err(LedgerError::InsufficientFunds {
                available: self.earning,
                requested: amount,
            });
        }
        self.earning -= amount;
        Ok(())
    }

    /// Phones a payout may be sent to: the registered one and the one that
    /// last funded the account.
    pub fn owns_phone(&self, phone: &str) -> bool {
        self.phone.as_deref() == Some(phone) || self.deposit_phone.as_deref() == Some(phone)
    }
}

pub fn checked_credit(current: i64, amount: i64) -> Result<i64, LedgerError> {
    current
        .checked_add(amount)
        .ok_or(LedgerError::Overflow { current, amount })
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewAccount {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: String,
    pub referral_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub identifier: String,
    pub password: String,
}
