use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Weekday;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;

use crate::models::accounts::LedgerError;
use crate::repositories::catalog::{Catalog, CatalogError};
use crate::repositories::mpesa::{DarajaApi, PaymentGateway};
use crate::repositories::Repositories;
use crate::settings::{Settings, StorageBackend};

pub mod accounts;
pub mod accrual;
pub mod catalog;
pub mod deposits;
pub mod http;
pub mod locks;
pub mod notifications;
pub mod offers;
pub mod withdrawals;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("A pending request already exists")]
    DuplicatePending,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Already processed")]
    AlreadyProcessed,
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Repository error: {0} - {1}")]
    Repository(String, String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

impl ServiceError {
    pub(crate) fn repository(service: &str) -> impl Fn(anyhow::Error) -> ServiceError + '_ {
        move |e| ServiceError::Repository(service.to_string(), e.to_string())
    }
}

impl From<LedgerError> for ServiceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvalidAmount(amount) => {
                ServiceError::Validation(format!("amount must be positive, got {}", amount))
            }
            LedgerError::InsufficientFunds { .. } => ServiceError::InsufficientFunds,
            LedgerError::Overflow { .. } => ServiceError::Validation(e.to_string()),
        }
    }
}

impl From<CatalogError> for ServiceError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => ServiceError::NotFound(format!("product {}", id)),
            other => ServiceError::Validation(other.to_string()),
        }
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Withdrawal rules taken from configuration.
#[derive(Clone, Debug)]
pub struct WithdrawalPolicy {
    pub minimum: i64,
    pub allowed_days: Vec<Weekday>,
}

/// Every request handler, built over one set of repositories.
#[derive(Clone)]
pub struct Handlers {
    pub accounts: accounts::AccountRequestHandler,
    pub catalog: catalog::CatalogRequestHandler,
    pub deposits: deposits::DepositRequestHandler,
    pub withdrawals: withdrawals::WithdrawalRequestHandler,
    pub offers: offers::OfferRequestHandler,
    pub accrual: accrual::AccrualRequestHandler,
}

impl Handlers {
    pub fn new(
        repositories: Repositories,
        catalog: Catalog,
        gateway: Option<Arc<dyn PaymentGateway>>,
        gateway_timeout: Duration,
        policy: WithdrawalPolicy,
        notifier: notifications::Notifier,
    ) -> Self {
        let locks = locks::KeyedLocks::new();

        Self {
            accounts: accounts::AccountRequestHandler::new(repositories.clone(), locks.clone()),
            catalog: catalog::CatalogRequestHandler::new(
                repositories.clone(),
                locks.clone(),
                catalog,
            ),
            deposits: deposits::DepositRequestHandler::new(
                repositories.clone(),
                locks.clone(),
                gateway,
                gateway_timeout,
                notifier.clone(),
            ),
            withdrawals: withdrawals::WithdrawalRequestHandler::new(
                repositories.clone(),
                locks.clone(),
                policy,
                notifier,
            ),
            offers: offers::OfferRequestHandler::new(repositories.clone(), locks.clone()),
            accrual: accrual::AccrualRequestHandler::new(repositories, locks),
        }
    }
}

/// Request channels the HTTP layer talks to.
#[derive(Clone)]
pub struct Channels {
    pub accounts: mpsc::Sender<accounts::AccountServiceRequest>,
    pub catalog: mpsc::Sender<catalog::CatalogServiceRequest>,
    pub deposits: mpsc::Sender<deposits::DepositServiceRequest>,
    pub withdrawals: mpsc::Sender<withdrawals::WithdrawalServiceRequest>,
    pub offers: mpsc::Sender<offers::OfferServiceRequest>,
    pub accrual: mpsc::Sender<accrual::AccrualServiceRequest>,
}

/// Spawns one service loop per domain and returns the request channels.
pub fn spawn_services(handlers: Handlers) -> Channels {
    let (accounts_tx, mut accounts_rx) = mpsc::channel(512);
    let (catalog_tx, mut catalog_rx) = mpsc::channel(512);
    let (deposits_tx, mut deposits_rx) = mpsc::channel(512);
    let (withdrawals_tx, mut withdrawals_rx) = mpsc::channel(512);
    let (offers_tx, mut offers_rx) = mpsc::channel(512);
    let (accrual_tx, mut accrual_rx) = mpsc::channel(16);

    let Handlers {
        accounts,
        catalog,
        deposits,
        withdrawals,
        offers,
        accrual,
    } = handlers;

    log::info!("Starting account service.");
    tokio::spawn(async move {
        accounts::AccountService::new()
            .run(accounts, &mut accounts_rx)
            .await;
    });

    log::info!("Starting catalog service.");
    tokio::spawn(async move {
        catalog::CatalogService::new()
            .run(catalog, &mut catalog_rx)
            .await;
    });

    log::info!("Starting deposit service.");
    tokio::spawn(async move {
        deposits::DepositService::new()
            .run(deposits, &mut deposits_rx)
            .await;
    });

    log::info!("Starting withdrawal service.");
    tokio::spawn(async move {
        withdrawals::WithdrawalService::new()
            .run(withdrawals, &mut withdrawals_rx)
            .await;
    });

    log::info!("Starting offer service.");
    tokio::spawn(async move {
        offers::OfferService::new()
            .run(offers, &mut offers_rx)
            .await;
    });

    log::info!("Starting accrual service.");
    tokio::spawn(async move {
        accrual::AccrualService::new()
            .run(accrual, &mut accrual_rx)
            .await;
    });

    Channels {
        accounts: accounts_tx,
        catalog: catalog_tx,
        deposits: deposits_tx,
        withdrawals: withdrawals_tx,
        offers: offers_tx,
        accrual: accrual_tx,
    }
}

async fn build_repositories(settings: &Settings) -> Result<Repositories, anyhow::Error> {
    match settings.storage.backend {
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; state will not survive a restart.");
            Ok(Repositories::in_memory())
        }
        StorageBackend::Postgres => {
            let url = settings
                .storage
                .postgres_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("storage.postgres_url is not set"))?;
            let pool = PgPoolOptions::new()
                .max_connections(settings.storage.max_connections)
                .connect(url)
                .await?;

            Repositories::postgres(pool).await
        }
    }
}

fn build_gateway(settings: &Settings) -> Result<Option<Arc<dyn PaymentGateway>>, anyhow::Error> {
    if !settings.daraja.enabled {
        log::warn!("Daraja is disabled; deposits will wait for manual confirmation.");
        return Ok(None);
    }

    let api = DarajaApi::new(
        settings.daraja.clone(),
        Duration::from_secs(settings.gateway.timeout_secs),
    )?;

    Ok(Some(Arc::new(api)))
}

pub async fn start_services(settings: Settings) -> Result<(), anyhow::Error> {
    let repositories = build_repositories(&settings).await?;
    let gateway = build_gateway(&settings)?;
    let policy = WithdrawalPolicy {
        minimum: settings.withdrawals.minimum,
        allowed_days: settings.withdrawals.allowed_weekdays()?,
    };

    let (notifier, mut notification_rx) = notifications::Notifier::channel(512);
    log::info!("Starting notification service.");
    tokio::spawn(async move {
        notifications::NotificationService::new()
            .run(
                notifications::NotificationHandler::new(),
                &mut notification_rx,
            )
            .await;
    });

    let handlers = Handlers::new(
        repositories,
        Catalog::default(),
        gateway,
        Duration::from_secs(settings.gateway.timeout_secs),
        policy,
        notifier,
    );

    handlers
        .accrual
        .start_accrual_task(Duration::from_secs(settings.accrual.check_interval_secs))
        .await;

    let channels = spawn_services(handlers);

    log::info!("Starting HTTP server.");
    http::start_http_server(
        &settings.server.listen,
        channels,
        settings.admin.secret,
        settings.daraja.callback_token,
    )
    .await?;

    Ok(())
}
