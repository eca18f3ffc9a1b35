use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Fixed,
    Offer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub daily_earn: i64,
    pub kind: ProductKind,
    pub lock: LockState,
    pub duration_hours: Option<i64>,
    /// When an offer entry was last unlocked. Shown to buyers only; each
    /// purchase opens its own payout window from the time of sale.
    pub start_time: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    pub fn fixed(id: &str, name: &str, price: i64, daily_earn: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            price,
            daily_earn,
            kind: ProductKind::Fixed,
            lock: LockState::Unlocked,
            duration_hours: None,
            start_time: None,
        }
    }

    pub fn offer(id: &str, name: &str, price: i64, daily_earn: i64, duration_hours: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            price,
            daily_earn,
            kind: ProductKind::Offer,
            lock: LockState::Locked,
            duration_hours: Some(duration_hours),
            start_time: None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock == LockState::Unlocked
    }
}

/// Product table the service starts with. Offer entries start locked.
pub fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::fixed("fridge-mini", "Mini Fridge", 500, 25),
        CatalogEntry::fixed("fridge-standard", "Standard Fridge", 1000, 55),
        CatalogEntry::fixed("fridge-deluxe", "Deluxe Fridge", 5000, 300),
        CatalogEntry::offer("offer-weekend", "Weekend Freezer", 2000, 0, 72),
        CatalogEntry::offer("offer-flash", "Flash Freezer", 1000, 0, 24),
    ]
}

/// Terms an offer entry is reopened with.
#[derive(Clone, Debug, Deserialize)]
pub struct UnlockOffer {
    pub price: i64,
    /// Listed on the entry for display. Offer holdings never accrue daily;
    /// they pay `price` once when their window closes.
    pub daily_earn: i64,
    pub duration_hours: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BuyFridge {
    pub product_id: String,
}
