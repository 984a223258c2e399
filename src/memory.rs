//! In-memory stores used as test doubles for the Postgres store.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    domain::{Account, Credential, Transaction, replace_credential},
    error::StorageError,
    store::{CredentialStore, ProjectionStore},
};

#[derive(Default)]
struct UserRecord {
    email: String,
    credentials: Vec<Credential>,
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl MemoryCredentialStore {
    pub fn with_user(self, user_id: &str, email: &str, credentials: Vec<Credential>) -> Self {
        self.users.lock().expect("credential store lock").insert(
            user_id.to_string(),
            UserRecord {
                email: email.to_string(),
                credentials,
            },
        );
        self
    }

    pub fn credentials_of(&self, user_id: &str) -> Vec<Credential> {
        self.users
            .lock()
            .expect("credential store lock")
            .get(user_id)
            .map(|record| record.credentials.clone())
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().expect("credential store lock").len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, user_id: &str) -> Result<Vec<Credential>, StorageError> {
        self.users
            .lock()
            .expect("credential store lock")
            .get(user_id)
            .map(|record| record.credentials.clone())
            .ok_or_else(|| StorageError::UnknownUser(user_id.to_string()))
    }

    async fn replace_by_kind(
        &self,
        user_id: &str,
        credential: &Credential,
    ) -> Result<(), StorageError> {
        let mut users = self.users.lock().expect("credential store lock");
        let record = users
            .get_mut(user_id)
            .ok_or_else(|| StorageError::UnknownUser(user_id.to_string()))?;
        replace_credential(&mut record.credentials, credential.clone());
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .users
            .lock()
            .expect("credential store lock")
            .iter()
            .find(|(_, record)| record.email == email)
            .map(|(user_id, _)| user_id.clone()))
    }

    async fn create_user(&self, email: &str, _full_name: &str) -> Result<String, StorageError> {
        let user_id = uuid::Uuid::new_v4().to_string();
        self.users.lock().expect("credential store lock").insert(
            user_id.clone(),
            UserRecord {
                email: email.to_string(),
                credentials: Vec::new(),
            },
        );
        Ok(user_id)
    }
}

#[derive(Default)]
pub struct MemoryProjectionStore {
    accounts: Mutex<BTreeMap<(String, String), Account>>,
    transactions: Mutex<BTreeMap<(String, String), Transaction>>,
    failing_accounts: Mutex<HashSet<String>>,
}

impl MemoryProjectionStore {
    /// Makes every transaction upsert for `account_id` fail.
    pub fn fail_transactions_for(self, account_id: &str) -> Self {
        self.failing_accounts
            .lock()
            .expect("projection store lock")
            .insert(account_id.to_string());
        self
    }

    pub fn account_count(&self) -> usize {
        self.accounts.lock().expect("projection store lock").len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().expect("projection store lock").len()
    }
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        self.accounts.lock().expect("projection store lock").insert(
            (account.user_id.clone(), account.account_id.clone()),
            account.clone(),
        );
        Ok(())
    }

    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StorageError> {
        if self
            .failing_accounts
            .lock()
            .expect("projection store lock")
            .contains(&transaction.account_id)
        {
            return Err(StorageError::Unavailable(format!(
                "write rejected for account_id={}",
                transaction.account_id
            )));
        }
        self.transactions.lock().expect("projection store lock").insert(
            (transaction.user_id.clone(), transaction.transaction_id.clone()),
            transaction.clone(),
        );
        Ok(())
    }

    async fn accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, StorageError> {
        Ok(self
            .accounts
            .lock()
            .expect("projection store lock")
            .values()
            .filter(|account| account.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>, StorageError> {
        let mut transactions: Vec<_> = self
            .transactions
            .lock()
            .expect("projection store lock")
            .values()
            .filter(|transaction| transaction.user_id == user_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(transactions)
    }
}
