use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DAILY_ACCRUAL: &str = "daily_accrual";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccrualOutcome {
    Completed {
        accounts_processed: usize,
        accounts_failed: usize,
        total_credited: i64,
    },
    Skipped {
        last_run: DateTime<Utc>,
    },
}
