use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "approved" => Ok(WithdrawalStatus::Approved),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            other => Err(anyhow::anyhow!("Unknown withdrawal status: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub account_id: String,
    pub amount: i64,
    pub phone: String,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl WithdrawalRequest {
    pub fn pending(id: String, account_id: String, amount: i64, phone: String) -> Self {
        Self {
            id,
            account_id,
            amount,
            phone,
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            reason: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewWithdrawal {
    pub amount: i64,
    pub phone: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RejectWithdrawal {
    pub reason: String,
}
