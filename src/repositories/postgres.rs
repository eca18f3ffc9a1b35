use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};

use super::{
    AccountRepository, DepositRepository, JobRepository, LedgerRepository, OfferRepository,
    WithdrawalRepository,
};
use crate::models::{
    accounts::{Account, FridgeHolding},
    deposits::{DepositRecord, DepositStatus, StkCallback},
    offers::OfferCode,
    withdrawals::{WithdrawalRequest, WithdrawalStatus},
};

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        phone TEXT UNIQUE,
        password_hash TEXT NOT NULL,
        api_token TEXT UNIQUE,
        balance BIGINT NOT NULL CHECK (balance >= 0),
        earning BIGINT NOT NULL CHECK (earning >= 0),
        fridges JSONB NOT NULL DEFAULT '[]',
        referral_code TEXT NOT NULL UNIQUE,
        referred_by TEXT,
        deposit_phone TEXT,
        last_deposit_attempt TIMESTAMPTZ,
        last_withdrawal_attempt TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deposits (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        phone TEXT NOT NULL,
        status TEXT NOT NULL,
        gateway_ref TEXT UNIQUE,
        created_at TIMESTAMPTZ NOT NULL,
        confirmed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        failure_reason TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parked_callbacks (
        gateway_ref TEXT PRIMARY KEY,
        merchant_request_id TEXT,
        result_code BIGINT NOT NULL,
        result_desc TEXT,
        received_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts (id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        phone TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        reason TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offer_codes (
        code TEXT PRIMARY KEY,
        reward BIGINT NOT NULL CHECK (reward > 0),
        used_by TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_metadata (
        name TEXT PRIMARY KEY,
        last_run TIMESTAMPTZ NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct PgStore {
    conn: PgPool,
}

impl PgStore {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }

    pub async fn migrate(&self) -> Result<(), anyhow::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.conn).await?;
        }

        log::info!("Database schema is up to date.");
        Ok(())
    }

    async fn fetch_account(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Account>, anyhow::Error> {
        let row = sqlx::query(&format!("SELECT * FROM accounts WHERE {} = $1", column))
            .bind(value)
            .fetch_optional(&self.conn)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, anyhow::Error> {
    let fridges: Json<Vec<FridgeHolding>> = row.try_get("fridges")?;

    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        api_token: row.try_get("api_token")?,
        balance: row.try_get("balance")?,
        earning: row.try_get("earning")?,
        fridges: fridges.0,
        referral_code: row.try_get("referral_code")?,
        referred_by: row.try_get("referred_by")?,
        deposit_phone: row.try_get("deposit_phone")?,
        last_deposit_attempt: row.try_get("last_deposit_attempt")?,
        last_withdrawal_attempt: row.try_get("last_withdrawal_attempt")?,
        created_at: row.try_get("created_at")?,
    })
}

fn deposit_from_row(row: &PgRow) -> Result<DepositRecord, anyhow::Error> {
    let status: String = row.try_get("status")?;

    Ok(DepositRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        phone: row.try_get("phone")?,
        status: status.parse()?,
        gateway_ref: row.try_get("gateway_ref")?,
        created_at: row.try_get("created_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
        failed_at: row.try_get("failed_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> Result<WithdrawalRequest, anyhow::Error> {
    let status: String = row.try_get("status")?;

    Ok(WithdrawalRequest {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        phone: row.try_get("phone")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        reason: row.try_get("reason")?,
    })
}

fn offer_from_row(row: &PgRow) -> Result<OfferCode, anyhow::Error> {
    let used_by: Vec<String> = row.try_get("used_by")?;

    Ok(OfferCode {
        code: row.try_get("code")?,
        reward: row.try_get("reward")?,
        used_by: used_by.into_iter().collect(),
        created_at: row.try_get("created_at")?,
    })
}

async fn upsert_account<'e, E>(executor: E, account: &Account) -> Result<(), anyhow::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO accounts
        (id, email, phone, password_hash, api_token, balance, earning, fridges,
         referral_code, referred_by, deposit_phone, last_deposit_attempt,
         last_withdrawal_attempt, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (id) DO UPDATE SET
            email = EXCLUDED.email,
            phone = EXCLUDED.phone,
            password_hash = EXCLUDED.password_hash,
            api_token = EXCLUDED.api_token,
            balance = EXCLUDED.balance,
            earning = EXCLUDED.earning,
            fridges = EXCLUDED.fridges,
            referral_code = EXCLUDED.referral_code,
            referred_by = EXCLUDED.referred_by,
            deposit_phone = EXCLUDED.deposit_phone,
            last_deposit_attempt = EXCLUDED.last_deposit_attempt,
            last_withdrawal_attempt = EXCLUDED.last_withdrawal_attempt
        "#,
    )
    .bind(&account.id)
    .bind(&account.email)
    .bind(&account.phone)
    .bind(&account.password_hash)
    .bind(&account.api_token)
    .bind(account.balance)
    .bind(account.earning)
    .bind(Json(&account.fridges))
    .bind(&account.referral_code)
    .bind(&account.referred_by)
    .bind(&account.deposit_phone)
    .bind(account.last_deposit_attempt)
    .bind(account.last_withdrawal_attempt)
    .bind(account.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_deposit<'e, E>(executor: E, deposit: &DepositRecord) -> Result<(), anyhow::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO deposits
        (id, account_id, amount, phone, status, gateway_ref, created_at,
         confirmed_at, failed_at, failure_reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            gateway_ref = EXCLUDED.gateway_ref,
            confirmed_at = EXCLUDED.confirmed_at,
            failed_at = EXCLUDED.failed_at,
            failure_reason = EXCLUDED.failure_reason
        "#,
    )
    .bind(&deposit.id)
    .bind(&deposit.account_id)
    .bind(deposit.amount)
    .bind(&deposit.phone)
    .bind(deposit.status.as_str())
    .bind(&deposit.gateway_ref)
    .bind(deposit.created_at)
    .bind(deposit.confirmed_at)
    .bind(deposit.failed_at)
    .bind(&deposit.failure_reason)
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_withdrawal<'e, E>(
    executor: E,
    withdrawal: &WithdrawalRequest,
) -> Result<(), anyhow::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO withdrawals
        (id, account_id, amount, phone, status, created_at, processed_at, reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            processed_at = EXCLUDED.processed_at,
            reason = EXCLUDED.reason
        "#,
    )
    .bind(&withdrawal.id)
    .bind(&withdrawal.account_id)
    .bind(withdrawal.amount)
    .bind(&withdrawal.phone)
    .bind(withdrawal.status.as_str())
    .bind(withdrawal.created_at)
    .bind(withdrawal.processed_at)
    .bind(&withdrawal.reason)
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_offer<'e, E>(executor: E, offer: &OfferCode) -> Result<(), anyhow::Error>
where
    E: PgExecutor<'e>,
{
    let used_by: Vec<String> = offer.used_by.iter().cloned().collect();

    sqlx::query(
        r#"
        INSERT INTO offer_codes (code, reward, used_by, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (code) DO UPDATE SET
            reward = EXCLUDED.reward,
            used_by = EXCLUDED.used_by
        "#,
    )
    .bind(&offer.code)
    .bind(offer.reward)
    .bind(used_by)
    .bind(offer.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn get(&self, id: &str) -> Result<Option<Account>, anyhow::Error> {
        self.fetch_account("id", id).await
    }

    async fn put(&self, account: &Account) -> Result<(), anyhow::Error> {
        upsert_account(&self.conn, account).await
    }

    async fn scan(&self) -> Result<Vec<Account>, anyhow::Error> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(&self.conn)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, anyhow::Error> {
        self.fetch_account("email", email).await
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Account>, anyhow::Error> {
        self.fetch_account("phone", phone).await
    }

    async fn find_by_referral_code(&self, code: &str) -> Result<Option<Account>, anyhow::Error> {
        self.fetch_account("referral_code", code).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Account>, anyhow::Error> {
        self.fetch_account("api_token", token).await
    }
}

#[async_trait]
impl DepositRepository for PgStore {
    async fn get(&self, id: &str) -> Result<Option<DepositRecord>, anyhow::Error> {
        let row = sqlx::query("SELECT * FROM deposits WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?;

        row.as_ref().map(deposit_from_row).transpose()
    }

    async fn put(&self, deposit: &DepositRecord) -> Result<(), anyhow::Error> {
        upsert_deposit(&self.conn, deposit).await
    }

    async fn find_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<DepositRecord>, anyhow::Error> {
        let row = sqlx::query("SELECT * FROM deposits WHERE gateway_ref = $1")
            .bind(gateway_ref)
            .fetch_optional(&self.conn)
            .await?;

        row.as_ref().map(deposit_from_row).transpose()
    }

    async fn list_by_account(&self, account_id: &str) -> Result<Vec<DepositRecord>, anyhow::Error> {
        let rows = sqlx::query("SELECT * FROM deposits WHERE account_id = $1 ORDER BY created_at")
            .bind(account_id)
            .fetch_all(&self.conn)
            .await?;

        rows.iter().map(deposit_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: DepositStatus,
    ) -> Result<Vec<DepositRecord>, anyhow::Error> {
        let rows = sqlx::query("SELECT * FROM deposits WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.conn)
            .await?;

        rows.iter().map(deposit_from_row).collect()
    }
    async fn park_callback(&self, callback: &StkCallback) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO parked_callbacks
            (gateway_ref, merchant_request_id, result_code, result_desc, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (gateway_ref) DO UPDATE SET
                merchant_request_id = EXCLUDED.merchant_request_id,
                result_code = EXCLUDED.result_code,
                result_desc = EXCLUDED.result_desc,
                received_at = EXCLUDED.received_at
            "#,
        )
        .bind(&callback.checkout_request_id)
        .bind(&callback.merchant_request_id)
        .bind(callback.result_code)
        .bind(&callback.result_desc)
        .bind(Utc::now())
        .execute(&self.conn)
        .await?;

        Ok(())
    }

    async fn take_parked_callback(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<StkCallback>, anyhow::Error> {
        let row = sqlx::query("DELETE FROM parked_callbacks WHERE gateway_ref = $1 RETURNING *")
            .bind(gateway_ref)
            .fetch_optional(&self.conn)
            .await?;

        row.map(|row| -> Result<StkCallback, anyhow::Error> {
            Ok(StkCallback {
                merchant_request_id: row.try_get("merchant_request_id")?,
                checkout_request_id: row.try_get("gateway_ref")?,
                result_code: row.try_get("result_code")?,
                result_desc: row.try_get("result_desc")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl WithdrawalRepository for PgStore {
    async fn get(&self, id: &str) -> Result<Option<WithdrawalRequest>, anyhow::Error> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.conn)
            .await?;

        row.as_ref().map(withdrawal_from_row).transpose()
    }

    async fn put(&self, withdrawal: &WithdrawalRequest) -> Result<(), anyhow::Error> {
        upsert_withdrawal(&self.conn, withdrawal).await
    }

    async fn list_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error> {
        let rows =
            sqlx::query("SELECT * FROM withdrawals WHERE account_id = $1 ORDER BY created_at")
                .bind(account_id)
                .fetch_all(&self.conn)
                .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: WithdrawalStatus,
    ) -> Result<Vec<WithdrawalRequest>, anyhow::Error> {
        let rows = sqlx::query("SELECT * FROM withdrawals WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.conn)
            .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }
}

#[async_trait]
impl OfferRepository for PgStore {
    async fn get(&self, code: &str) -> Result<Option<OfferCode>, anyhow::Error> {
        let row = sqlx::query("SELECT * FROM offer_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.conn)
            .await?;

        row.as_ref().map(offer_from_row).transpose()
    }

    async fn put(&self, offer: &OfferCode) -> Result<(), anyhow::Error> {
        upsert_offer(&self.conn, offer).await
    }
}

#[async_trait]
impl LedgerRepository for PgStore {
    async fn commit_deposit(
        &self,
        deposit: &DepositRecord,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        let mut tx = self.conn.begin().await?;
        upsert_deposit(&mut *tx, deposit).await?;
        upsert_account(&mut *tx, account).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn commit_withdrawal(
        &self,
        withdrawal: &WithdrawalRequest,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        let mut tx = self.conn.begin().await?;
        upsert_withdrawal(&mut *tx, withdrawal).await?;
        upsert_account(&mut *tx, account).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn commit_redemption(
        &self,
        offer: &OfferCode,
        account: &Account,
    ) -> Result<(), anyhow::Error> {
        let mut tx = self.conn.begin().await?;
        upsert_offer(&mut *tx, offer).await?;
        upsert_account(&mut *tx, account).await?;
        tx.commit().await?;

        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgStore {
    async fn last_run(&self, job: &str) -> Result<Option<DateTime<Utc>>, anyhow::Error> {
        let last_run: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_run FROM job_metadata WHERE name = $1")
                .bind(job)
                .fetch_optional(&self.conn)
                .await?;

        Ok(last_run)
    }

    async fn set_last_run(&self, job: &str, at: DateTime<Utc>) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO job_metadata (name, last_run) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET last_run = EXCLUDED.last_run
            "#,
        )
        .bind(job)
        .bind(at)
        .execute(&self.conn)
        .await?;

        Ok(())
    }
}
