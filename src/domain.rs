use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::provider::{ProviderAccount, ProviderTransaction, TokenPair};

/// A provider-scoped token pair belonging to a user.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct Credential {
    pub kind: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn issue(kind: &str, tokens: TokenPair, expires_at: DateTime<Utc>) -> Self {
        Credential {
            kind: kind.to_string(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_token_expires_at: expires_at,
        }
    }

    /// The access token may be used without a refresh only while its expiry is
    /// strictly in the future.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.access_token_expires_at > now
    }
}

/// Drops every credential sharing the replacement's kind, then appends the
/// replacement. The list never holds two credentials of one kind afterwards.
pub fn replace_credential(credentials: &mut Vec<Credential>, replacement: Credential) {
    credentials.retain(|credential| credential.kind != replacement.kind);
    credentials.push(replacement);
}

pub fn find_credential<'a>(credentials: &'a [Credential], kind: &str) -> Option<&'a Credential> {
    credentials.iter().find(|credential| credential.kind == kind)
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct Account {
    pub user_id: String,
    pub account_id: String,
    pub account_type: Option<String>,
    pub display_name: Option<String>,
    pub currency: String,
    pub description: Option<String>,
    pub account_number: Value,
    pub provider: Value,
    pub update_timestamp: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl Account {
    pub fn from_provider(
        user_id: &str,
        account: &ProviderAccount,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Account {
            user_id: user_id.to_string(),
            account_id: account.account_id.clone(),
            account_type: account.account_type.clone(),
            display_name: account.display_name.clone(),
            currency: account.currency.clone(),
            description: account.description.clone(),
            account_number: account.account_number.clone(),
            provider: account.provider.clone(),
            update_timestamp: account.update_timestamp,
            synced_at,
        }
    }
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    pub user_id: String,
    pub transaction_id: String,
    pub account_id: String,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_type: Option<String>,
    pub transaction_category: Option<String>,
    pub meta: Value,
    pub synced_at: DateTime<Utc>,
}

impl Transaction {
    pub fn from_provider(
        user_id: &str,
        account_id: &str,
        transaction: &ProviderTransaction,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Transaction {
            user_id: user_id.to_string(),
            transaction_id: transaction.transaction_id.clone(),
            account_id: account_id.to_string(),
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            description: transaction.description.clone(),
            timestamp: transaction.timestamp,
            transaction_type: transaction.transaction_type.clone(),
            transaction_category: transaction.transaction_category.clone(),
            meta: transaction.meta.clone(),
            synced_at,
        }
    }
}
