use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{GatewayError, PaymentGateway};
use crate::settings::Daraja;

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<String>,
    response_description: Option<String>,
}

pub struct DarajaApi {
    settings: Daraja,
    client: reqwest::Client,
}

impl DarajaApi {
    pub fn new(settings: Daraja, timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { settings, client })
    }

    fn callback_url(&self) -> String {
        format!(
            "{}/{}",
            self.settings.callback_url.trim_end_matches('/'),
            self.settings.callback_token
        )
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let token: AccessToken = self
            .client
            .get(format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.settings.base_url
            ))
            .basic_auth(
                &self.settings.consumer_key,
                Some(&self.settings.consumer_secret),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(token.access_token)
    }
}

/// Daraja wants East Africa Time (UTC+3) stamps.
fn timestamp(now: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(3 * 3600) {
        Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
        None => now.format("%Y%m%d%H%M%S").to_string(),
    }
}

fn password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

#[async_trait]
impl PaymentGateway for DarajaApi {
    async fn request_push(
        &self,
        phone: &str,
        amount: i64,
        reference: &str,
    ) -> Result<String, GatewayError> {
        let token = self.access_token().await?;
        let timestamp = timestamp(Utc::now());
        let payload = json!({
            "BusinessShortCode": self.settings.shortcode,
            "Password": password(&self.settings.shortcode, &self.settings.passkey, &timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.settings.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.callback_url(),
            "AccountReference": reference,
            "TransactionDesc": "Bitfreeze deposit"
        });

        let response: StkPushResponse = self
            .client
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.settings.base_url
            ))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        match (response.response_code.as_deref(), response.checkout_request_id) {
            (Some("0"), Some(checkout_request_id)) => Ok(checkout_request_id),
            (Some(code), _) if code != "0" => Err(GatewayError::Rejected {
                code: code.to_string(),
                description: response.response_description.unwrap_or_default(),
            }),
            _ => Err(GatewayError::BadResponse(
                "Daraja: missing CheckoutRequestID.".to_string(),
            )),
        }
    }
}
