use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DepositStatus::Pending)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DepositStatus::Pending),
            "confirmed" => Ok(DepositStatus::Confirmed),
            "failed" => Ok(DepositStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown deposit status: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DepositRecord {
    pub id: String,
    pub account_id: String,
    pub amount: i64,
    pub phone: String,
    pub status: DepositStatus,
    /// Daraja's `CheckoutRequestID`. Kept out of API responses since it is
    /// the only thing a callback needs to name.
    #[serde(skip_serializing)]
    pub gateway_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl DepositRecord {
    pub fn pending(id: String, account_id: String, amount: i64, phone: String) -> Self {
        Self {
            id,
            account_id,
            amount,
            phone,
            status: DepositStatus::Pending,
            gateway_ref: None,
            created_at: Utc::now(),
            confirmed_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewDeposit {
    pub amount: i64,
    pub phone: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FailDeposit {
    pub reason: Option<String>,
}

/// Envelope Daraja posts to the STK push callback URL.
#[derive(Clone, Debug, Deserialize)]
pub struct DarajaCallback {
    #[serde(rename = "Body")]
    pub body: DarajaCallbackBody,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DarajaCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: Option<String>,
}
