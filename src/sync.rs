use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::{
    domain::{Account, Transaction},
    error::ServiceError,
    provider::ProviderClient,
    store::ProjectionStore,
    tokens::TokenManager,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    Provider(String),
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountOutcome {
    Synced {
        account_id: String,
        transactions: usize,
    },
    Failed {
        account_id: String,
        reason: FailureReason,
    },
}

impl AccountOutcome {
    pub fn account_id(&self) -> &str {
        match self {
            AccountOutcome::Synced { account_id, .. }
            | AccountOutcome::Failed { account_id, .. } => account_id,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, AccountOutcome::Synced { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Every account's transactions were synced.
    Complete,
    /// Some accounts failed.
    Partial,
    /// Accounts were listed but none of their transactions could be synced.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub user_id: String,
    pub kind: String,
    pub status: SyncStatus,
    pub accounts: usize,
    pub transactions: usize,
    pub outcomes: Vec<AccountOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(
        user_id: &str,
        kind: &str,
        outcomes: Vec<AccountOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let synced = outcomes.iter().filter(|outcome| outcome.is_synced()).count();
        let status = if synced == outcomes.len() {
            SyncStatus::Complete
        } else if synced == 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        };
        let transactions = outcomes
            .iter()
            .map(|outcome| match outcome {
                AccountOutcome::Synced { transactions, .. } => *transactions,
                AccountOutcome::Failed { .. } => 0,
            })
            .sum();

        SyncReport {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            status,
            accounts: outcomes.len(),
            transactions,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed_accounts(&self) -> impl Iterator<Item = &AccountOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_synced())
    }
}

pub struct SyncEngine {
    tokens: Arc<TokenManager>,
    provider: Arc<dyn ProviderClient>,
    projection: Arc<dyn ProjectionStore>,
    kind: String,
    concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        tokens: Arc<TokenManager>,
        provider: Arc<dyn ProviderClient>,
        projection: Arc<dyn ProjectionStore>,
        kind: &str,
        concurrency: usize,
    ) -> Self {
        SyncEngine {
            tokens,
            provider,
            projection,
            kind: kind.to_string(),
            concurrency: concurrency.max(1),
        }
    }

    /// Runs one sync pass for the user.
    ///
    /// Errors are returned only when the pass could not start: no usable
    /// token, the account list could not be fetched, or an account could not
    /// be stored. Per-account transaction failures end up in the report.
    pub async fn sync_user(&self, user_id: &str) -> Result<SyncReport, ServiceError> {
        let started_at = Utc::now();
        let access_token = self.tokens.valid_access_token(user_id, &self.kind).await?;

        let provider_accounts = self
            .provider
            .get_accounts(&access_token)
            .await
            .inspect_err(|err| {
                tracing::error!("Failed to list accounts for user_id={}: {}", user_id, err);
            })?;

        tracing::info!(
            "Found {} accounts for user_id={}",
            provider_accounts.len(),
            user_id
        );

        let synced_at = Utc::now();
        for provider_account in provider_accounts.iter() {
            let account = Account::from_provider(user_id, provider_account, synced_at);
            tracing::info!(
                "Upserting account_id={} for user_id={}",
                &account.account_id,
                user_id
            );
            self.projection.upsert_account(&account).await?;
        }

        // Built before streaming so the returned future stays Send.
        let fetches: Vec<_> = provider_accounts
            .iter()
            .map(|account| self.sync_transactions(user_id, &access_token, &account.account_id))
            .collect();
        let outcomes: Vec<_> = stream::iter(fetches)
            .buffered(self.concurrency)
            .collect()
            .await;

        let report = SyncReport::new(user_id, &self.kind, outcomes, started_at);
        for failed in report.failed_accounts() {
            tracing::warn!(
                "Account account_id={} failed to sync for user_id={}: {:?}",
                failed.account_id(),
                user_id,
                failed
            );
        }
        tracing::info!(
            "Sync for user_id={} finished with status={:?}: {} accounts, {} transactions",
            user_id,
            report.status,
            report.accounts,
            report.transactions
        );

        Ok(report)
    }

    async fn sync_transactions(
        &self,
        user_id: &str,
        access_token: &str,
        account_id: &str,
    ) -> AccountOutcome {
        let fetched = match self.provider.get_transactions(access_token, account_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                return AccountOutcome::Failed {
                    account_id: account_id.to_string(),
                    reason: FailureReason::Provider(err.to_string()),
                };
            }
        };

        tracing::info!(
            "Retrieved {} transactions for account_id={}",
            fetched.len(),
            account_id
        );

        let synced_at = Utc::now();
        for provider_transaction in fetched.iter() {
            let transaction =
                Transaction::from_provider(user_id, account_id, provider_transaction, synced_at);
            if let Err(err) = self.projection.upsert_transaction(&transaction).await {
                return AccountOutcome::Failed {
                    account_id: account_id.to_string(),
                    reason: FailureReason::Storage(err.to_string()),
                };
            }
        }

        AccountOutcome::Synced {
            account_id: account_id.to_string(),
            transactions: fetched.len(),
        }
    }
}
