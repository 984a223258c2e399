use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};

use crate::{
    domain::{Account, Credential, Transaction},
    error::StorageError,
    store::{CredentialStore, ProjectionStore},
};

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }
}

/// Takes a row lock on the user so concurrent credential replacements for the
/// same user serialise.
async fn lock_user(
    tx: &mut PgTransaction<'_, Postgres>,
    user_id: &str,
) -> Result<(), StorageError> {
    sqlx::query_scalar::<_, String>(
        "
            SELECT id FROM users
            WHERE id = $1
            FOR UPDATE
        ",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(|_| ())
    .ok_or_else(|| StorageError::UnknownUser(user_id.to_string()))
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn get(&self, user_id: &str) -> Result<Vec<Credential>, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "
                SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)
            ",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Err(StorageError::UnknownUser(user_id.to_string()));
        }

        let credentials = sqlx::query_as::<_, Credential>(
            "
                SELECT kind, access_token, refresh_token, access_token_expires_at
                FROM credentials
                WHERE user_id = $1
                ORDER BY kind
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(credentials)
    }

    async fn replace_by_kind(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        lock_user(&mut tx, user_id).await?;

        sqlx::query(
            "
                DELETE FROM credentials
                WHERE user_id = $1 AND kind = $2
            ",
        )
        .bind(user_id)
        .bind(&credential.kind)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "
                INSERT INTO credentials (
                    user_id,
                    kind,
                    access_token,
                    refresh_token,
                    access_token_expires_at
                ) VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(user_id)
        .bind(&credential.kind)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.access_token_expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Replaced {} credential for user_id={}",
            &credential.kind,
            user_id
        );
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<String>, StorageError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "
                SELECT id FROM users
                WHERE email = $1
            ",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id)
    }

    async fn create_user(&self, email: &str, full_name: &str) -> Result<String, StorageError> {
        let user_id = sqlx::query_scalar::<_, String>(
            "
                INSERT INTO users (id, email, full_name)
                VALUES ($1, $2, $3)
                RETURNING id
            ",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(email)
        .bind(full_name)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!("Created user_id={}", &user_id);
        Ok(user_id)
    }
}

#[async_trait]
impl ProjectionStore for PgStore {
    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            "
                INSERT INTO accounts (
                    user_id,
                    account_id,
                    account_type,
                    display_name,
                    currency,
                    description,
                    account_number,
                    provider,
                    update_timestamp,
                    synced_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (user_id, account_id)
                DO UPDATE SET
                    account_type = EXCLUDED.account_type,
                    display_name = EXCLUDED.display_name,
                    currency = EXCLUDED.currency,
                    description = EXCLUDED.description,
                    account_number = EXCLUDED.account_number,
                    provider = EXCLUDED.provider,
                    update_timestamp = EXCLUDED.update_timestamp,
                    synced_at = EXCLUDED.synced_at
            ",
        )
        .bind(&account.user_id)
        .bind(&account.account_id)
        .bind(&account.account_type)
        .bind(&account.display_name)
        .bind(&account.currency)
        .bind(&account.description)
        .bind(&account.account_number)
        .bind(&account.provider)
        .bind(account.update_timestamp)
        .bind(account.synced_at)
        .execute(&self.pool)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to upsert account_id={} user_id={}: {}",
                &account.account_id,
                &account.user_id,
                err
            );
        })?;

        Ok(())
    }

    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        sqlx::query(
            "
                INSERT INTO transactions (
                    user_id,
                    transaction_id,
                    account_id,
                    amount,
                    currency,
                    description,
                    timestamp,
                    transaction_type,
                    transaction_category,
                    meta,
                    synced_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (user_id, transaction_id)
                DO UPDATE SET
                    account_id = EXCLUDED.account_id,
                    amount = EXCLUDED.amount,
                    currency = EXCLUDED.currency,
                    description = EXCLUDED.description,
                    timestamp = EXCLUDED.timestamp,
                    transaction_type = EXCLUDED.transaction_type,
                    transaction_category = EXCLUDED.transaction_category,
                    meta = EXCLUDED.meta,
                    synced_at = EXCLUDED.synced_at
            ",
        )
        .bind(&transaction.user_id)
        .bind(&transaction.transaction_id)
        .bind(&transaction.account_id)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.description)
        .bind(transaction.timestamp)
        .bind(&transaction.transaction_type)
        .bind(&transaction.transaction_category)
        .bind(&transaction.meta)
        .bind(transaction.synced_at)
        .execute(&self.pool)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Failed to upsert transaction_id={} account_id={}: {}",
                &transaction.transaction_id,
                &transaction.account_id,
                err
            );
        })?;

        Ok(())
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, StorageError> {
        let accounts = sqlx::query_as::<_, Account>(
            "
                SELECT * FROM accounts
                WHERE user_id = $1
                ORDER BY account_id
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>, StorageError> {
        let transactions = sqlx::query_as::<_, Transaction>(
            "
                SELECT * FROM transactions
                WHERE user_id = $1
                ORDER BY timestamp DESC
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }
}
