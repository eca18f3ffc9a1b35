use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{locks::KeyedLocks, RequestHandler, Service, ServiceError};
use crate::models::accounts::{Account, Credentials, NewAccount};
use crate::repositories::{mpesa::normalize_phone, Repositories};

const MIN_PASSWORD_LENGTH: usize = 6;
const REFERRAL_CODE_LENGTH: usize = 8;

pub enum AccountServiceRequest {
    Register {
        account: NewAccount,
        response: oneshot::Sender<Result<Account, ServiceError>>,
    },
    Login {
        credentials: Credentials,
        response: oneshot::Sender<Result<String, ServiceError>>,
    },
    Authenticate {
        token: String,
        response: oneshot::Sender<Result<Account, ServiceError>>,
    },
    GetAccount {
        id: String,
        response: oneshot::Sender<Result<Account, ServiceError>>,
    },
}

fn hash_password(password: &str, salt: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", salt, password).as_bytes());
    format!("{}${}", salt, hex::encode(digest))
}

fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, _)) => hash_password(password, salt) == stored,
        None => false,
    }
}

fn generate_referral_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

#[derive(Clone)]
pub struct AccountRequestHandler {
    repositories: Repositories,
    locks: KeyedLocks,
}

impl AccountRequestHandler {
    pub fn new(repositories: Repositories, locks: KeyedLocks) -> Self {
        AccountRequestHandler {
            repositories,
            locks,
        }
    }

    pub async fn register(&self, new_account: NewAccount) -> Result<Account, ServiceError> {
        let email = new_account
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        if let Some(email) = &email {
            if !email.contains('@') {
                return Err(ServiceError::Validation(format!("invalid email: {}", email)));
            }
        }
        let phone = match new_account.phone.filter(|p| !p.trim().is_empty()) {
            Some(phone) => Some(
                normalize_phone(&phone)
                    .ok_or_else(|| ServiceError::Validation(format!("invalid phone: {}", phone)))?,
            ),
            None => None,
        };
        if email.is_none() && phone.is_none() {
            return Err(ServiceError::Validation(
                "an email or a phone number is required".to_string(),
            ));
        }
        if new_account.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(ServiceError::Validation(format!(
                "password must have at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }

        // Uniqueness checks and the insert must not interleave.
        let _guard = self.locks.lock("registration").await;
        let accounts = &self.repositories.accounts;

        if let Some(email) = &email {
            if accounts
                .find_by_email(email)
                .await
                .map_err(ServiceError::repository("Accounts"))?
                .is_some()
            {
                return Err(ServiceError::Validation("email already registered".to_string()));
            }
        }
        if let Some(phone) = &phone {
            if accounts
                .find_by_phone(phone)
                .await
                .map_err(ServiceError::repository("Accounts"))?
                .is_some()
            {
                return Err(ServiceError::Validation("phone already registered".to_string()));
            }
        }

        let referred_by = match new_account.referral_code {
            Some(code) if !code.trim().is_empty() => {
                let code = code.trim().to_uppercase();
                accounts
                    .find_by_referral_code(&code)
                    .await
                    .map_err(ServiceError::repository("Accounts"))?
                    .ok_or_else(|| {
                        ServiceError::Validation(format!("unknown referral code: {}", code))
                    })?;
                Some(code)
            }
            _ => None,
        };

        let referral_code = self.unique_referral_code().await?;
        let salt = Uuid::new_v4().simple().to_string();
        let account = Account::new(
            Uuid::new_v4().hyphenated().to_string(),
            email,
            phone,
            hash_password(&new_account.password, &salt),
            referral_code,
            referred_by,
        );

        accounts
            .put(&account)
            .await
            .map_err(ServiceError::repository("Accounts"))?;

        log::info!("Registered account {}.", account.id);
        Ok(account)
    }

    async fn unique_referral_code(&self) -> Result<String, ServiceError> {
        for _ in 0..5 {
            let code = generate_referral_code();
            let taken = self
                .repositories
                .accounts
                .find_by_referral_code(&code)
                .await
                .map_err(ServiceError::repository("Accounts"))?;
            if taken.is_none() {
                return Ok(code);
            }
        }

        Err(ServiceError::Internal(
            "could not allocate a referral code".to_string(),
        ))
    }

    pub async fn login(&self, credentials: Credentials) -> Result<String, ServiceError> {
        let identifier = credentials.identifier.trim();
        let accounts = &self.repositories.accounts;

        let account = if identifier.contains('@') {
            accounts.find_by_email(&identifier.to_lowercase()).await
        } else {
            match normalize_phone(identifier) {
                Some(phone) => accounts.find_by_phone(&phone).await,
                None => Ok(None),
            }
        }
        .map_err(ServiceError::repository("Accounts"))?
        .ok_or(ServiceError::Unauthorized)?;

        if !verify_password(&credentials.password, &account.password_hash) {
            log::debug!("Failed login for account {}.", account.id);
            return Err(ServiceError::Unauthorized);
        }

        let _guard = self.locks.lock_account(&account.id).await;
        let mut account = self.get_account(&account.id).await?;
        let token = Uuid::new_v4().simple().to_string();
        account.api_token = Some(token.clone());
        accounts
            .put(&account)
            .await
            .map_err(ServiceError::repository("Accounts"))?;

        Ok(token)
    }

    pub async fn authenticate(&self, token: &str) -> Result<Account, ServiceError> {
        if token.is_empty() {
            return Err(ServiceError::Unauthorized);
        }

        self.repositories
            .accounts
            .find_by_token(token)
            .await
            .map_err(ServiceError::repository("Accounts"))?
            .ok_or(ServiceError::Unauthorized)
    }

    pub async fn get_account(&self, id: &str) -> Result<Account, ServiceError> {
        self.repositories
            .accounts
            .get(id)
            .await
            .map_err(ServiceError::repository("Accounts"))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", id)))
    }
}

#[async_trait]
impl RequestHandler<AccountServiceRequest> for AccountRequestHandler {
    async fn handle_request(&self, request: AccountServiceRequest) {
        match request {
            AccountServiceRequest::Register { account, response } => {
                let _ = response.send(self.register(account).await);
            }
            AccountServiceRequest::Login {
                credentials,
                response,
            } => {
                let _ = response.send(self.login(credentials).await);
            }
            AccountServiceRequest::Authenticate { token, response } => {
                let _ = response.send(self.authenticate(&token).await);
            }
            AccountServiceRequest::GetAccount { id, response } => {
                let _ = response.send(self.get_account(&id).await);
            }
        }
    }
}

pub struct AccountService;

impl AccountService {
    pub fn new() -> Self {
        AccountService {}
    }
}

#[async_trait]
impl Service<AccountServiceRequest, AccountRequestHandler> for AccountService {}
