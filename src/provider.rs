use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAccount {
    pub account_id: String,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub account_number: Value,
    #[serde(default)]
    pub provider: Value,
    #[serde(default)]
    pub update_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub transaction_category: Option<String>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub full_name: String,
}

/// The remote financial data API.
///
/// Implementations perform one network round trip per call and never retry;
/// retry policy belongs to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// URL the user is sent to in order to grant access.
    fn authorisation_url(&self, redirect_uri: &str, state: &str) -> String;

    async fn exchange_code_for_token(
        &self,
        redirect_uri: &str,
        code: &str,
    ) -> Result<TokenPair, ProviderError>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenPair, ProviderError>;

    async fn get_accounts(&self, access_token: &str)
    -> Result<Vec<ProviderAccount>, ProviderError>;

    async fn get_transactions(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;

    async fn get_info(&self, access_token: &str) -> Result<ProviderInfo, ProviderError>;
}
