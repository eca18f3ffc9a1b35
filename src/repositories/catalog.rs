use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::catalog::{default_catalog, CatalogEntry, LockState, ProductKind, UnlockOffer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown product: {0}")]
    NotFound(String),
    #[error("Product {0} is not an offer and cannot be locked or unlocked")]
    NotLockable(String),
    #[error("Invalid offer terms: {0}")]
    InvalidTerms(String),
}

/// Process-wide product table. Readers get clones; the admin actions are
/// the only writers.
#[derive(Clone)]
pub struct Catalog {
    entries: Arc<RwLock<Vec<CatalogEntry>>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(default_catalog())
    }
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub async fn list(&self) -> Vec<CatalogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn find(&self, id: &str) -> Result<CatalogEntry, CatalogError> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub async fn lock(&self, id: &str) -> Result<CatalogEntry, CatalogError> {
        let mut entries = self.entries.write().await;
        let entry = offer_entry(&mut entries, id)?;

        entry.lock = LockState::Locked;
        entry.start_time = None;

        log::info!("Catalog entry {} locked.", id);
        Ok(entry.clone())
    }

    pub async fn unlock(
        &self,
        id: &str,
        terms: &UnlockOffer,
        now: DateTime<Utc>,
    ) -> Result<CatalogEntry, CatalogError> {
        if terms.price <= 0 {
            return Err(CatalogError::InvalidTerms("price must be positive".to_string()));
        }
        if terms.daily_earn < 0 {
            return Err(CatalogError::InvalidTerms(
                "daily earn cannot be negative".to_string(),
            ));
        }
        if terms.duration_hours <= 0 {
            return Err(CatalogError::InvalidTerms(
                "duration must be positive".to_string(),
            ));
        }

        let mut entries = self.entries.write().await;
        let entry = offer_entry(&mut entries, id)?;

        entry.price = terms.price;
        entry.daily_earn = terms.daily_earn;
        entry.duration_hours = Some(terms.duration_hours);
        entry.start_time = Some(now);
        entry.lock = LockState::Unlocked;

        log::info!(
            "Catalog entry {} unlocked: price={}, duration={}h.",
            id,
            terms.price,
            terms.duration_hours
        );
        Ok(entry.clone())
    }
}

fn offer_entry<'a>(
    entries: &'a mut [CatalogEntry],
    id: &str,
) -> Result<&'a mut CatalogEntry, CatalogError> {
    let entry = entries
        .iter_mut()
        .find(|entry| entry.id == id)
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

    match entry.kind {
        ProductKind::Offer => Ok(entry),
        ProductKind::Fixed => Err(CatalogError::NotLockable(id.to_string())),
    }
}
