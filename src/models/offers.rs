use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OfferCode {
    pub code: String,
    pub reward: i64,
    pub used_by: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl OfferCode {
    pub fn new(code: String, reward: i64) -> Self {
        Self {
            code,
            reward,
            used_by: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_used_by(&self, account_id: &str) -> bool {
        self.used_by.contains(account_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewOfferCode {
    pub code: String,
    pub reward: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedeemOffer {
    pub code: String,
}
