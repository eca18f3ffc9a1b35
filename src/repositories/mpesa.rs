use async_trait::async_trait;

pub mod daraja;

pub use daraja::DarajaApi;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Gateway rejected request: {code} - {description}")]
    Rejected { code: String, description: String },
    #[error("Gateway returned a bad response: {0}")]
    BadResponse(String),
    #[error("Gateway timed out after {0}s")]
    Timeout(u64),
}

/// Mobile-money provider able to push a payment prompt to a payer's phone.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a push payment and returns the provider's correlation id.
    async fn request_push(
        &self,
        phone: &str,
        amount: i64,
        reference: &str,
    ) -> Result<String, GatewayError>;
}

/// Normalizes Kenyan MSISDNs to the `2547XXXXXXXX` form the provider expects.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let national = if let Some(rest) = digits.strip_prefix("254") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits.as_str()
    };

    if national.len() == 9 && (national.starts_with('7') || national.starts_with('1')) {
        Some(format!("254{}", national))
    } else {
        None
    }
}
