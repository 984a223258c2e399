use async_trait::async_trait;

use crate::{
    domain::{Account, Credential, Transaction},
    error::StorageError,
};

/// Per-user provider credentials plus the user lookups needed to link a new
/// identity.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with [`StorageError::UnknownUser`] when the user does not exist.
    async fn get(&self, user_id: &str) -> Result<Vec<Credential>, StorageError>;

    /// Atomically removes every credential of `credential.kind` for the user
    /// and stores `credential` in their place. Readers never observe the
    /// intermediate state.
    async fn replace_by_kind(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<(), StorageError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<String>, StorageError>;

    async fn create_user(&self, email: &str, full_name: &str) -> Result<String, StorageError>;
}

/// Idempotent sink for provider data, keyed by (user, provider-native id).
/// Upserts overwrite every attribute and are last-writer-wins.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError>;

    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StorageError>;

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, StorageError>;

    /// Newest first.
    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>, StorageError>;
}
