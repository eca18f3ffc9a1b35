pub mod accounts;
pub mod catalog;
pub mod deposits;
pub mod jobs;
pub mod offers;
pub mod withdrawals;
