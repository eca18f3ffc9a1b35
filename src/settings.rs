use chrono::Weekday;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Server {
    pub listen: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Storage {
    pub backend: StorageBackend,
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Admin {
    pub secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Daraja {
    pub enabled: bool,
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    /// Base URL Daraja posts results to; `callback_token` is appended as the
    /// last path segment.
    pub callback_url: String,
    pub callback_token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Gateway {
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Withdrawals {
    pub minimum: i64,
    pub allowed_days: Vec<String>,
}

impl Withdrawals {
    pub fn allowed_weekdays(&self) -> Result<Vec<Weekday>, ConfigError> {
        self.allowed_days
            .iter()
            .map(|day| {
                day.parse::<Weekday>()
                    .map_err(|_| ConfigError::Message(format!("Invalid weekday: {}", day)))
            })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Accrual {
    pub check_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub server: Server,
    pub storage: Storage,
    pub admin: Admin,
    pub daraja: Daraja,
    pub gateway: Gateway,
    pub withdrawals: Withdrawals,
    pub accrual: Accrual,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.listen", "0.0.0.0:8080")?
            .set_default("storage.backend", "postgres")?
            .set_default("storage.max_connections", 5)?
            .set_default("daraja.enabled", false)?
            .set_default("daraja.base_url", "https://sandbox.safaricom.co.ke")?
            .set_default("daraja.consumer_key", "")?
            .set_default("daraja.consumer_secret", "")?
            .set_default("daraja.shortcode", "174379")?
            .set_default("daraja.passkey", "")?
            .set_default("daraja.callback_url", "")?
            .set_default("daraja.callback_token", "")?
            .set_default("gateway.timeout_secs", 15)?
            .set_default("withdrawals.minimum", 200)?
            .set_default(
                "withdrawals.allowed_days",
                vec!["Mon", "Tue", "Wed", "Thu", "Fri"],
            )?
            .set_default("accrual.check_interval_secs", 3600)?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("BITFREEZE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.admin.secret.is_empty() {
            return Err(ConfigError::Message("admin.secret must be set".to_string()));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.postgres_url.is_none() {
            return Err(ConfigError::Message(
                "storage.postgres_url is required for the postgres backend".to_string(),
            ));
        }
        if self.withdrawals.minimum <= 0 {
            return Err(ConfigError::Message(
                "withdrawals.minimum must be positive".to_string(),
            ));
        }
        if self.daraja.enabled && self.daraja.callback_token.is_empty() {
            return Err(ConfigError::Message(
                "daraja.callback_token must be set when Daraja is enabled".to_string(),
            ));
        }
        self.withdrawals.allowed_weekdays()?;

        Ok(())
    }
}
