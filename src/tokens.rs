//! Access token lifecycle: fast-path reuse, single-flight refresh and atomic
//! credential replacement.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    domain::{Credential, find_credential},
    error::{ProviderError, ServiceError},
    provider::{ProviderClient, TokenPair},
    store::CredentialStore,
};

/// An access token that was valid when it was handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub access_token: String,
    /// Whether this call had to refresh the credential.
    pub refreshed: bool,
}

type GuardKey = (String, String);

pub struct TokenManager {
    credentials: Arc<dyn CredentialStore>,
    provider: Arc<dyn ProviderClient>,
    token_lifetime: Duration,
    refresh_guards: DashMap<GuardKey, Arc<Mutex<()>>>,
    /// Last refresh token the provider rejected, per (user, kind).
    rejected_refresh_tokens: DashMap<GuardKey, String>,
}

impl TokenManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn ProviderClient>,
        token_lifetime: Duration,
    ) -> Self {
        TokenManager {
            credentials,
            provider,
            token_lifetime,
            refresh_guards: DashMap::new(),
            rejected_refresh_tokens: DashMap::new(),
        }
    }

    /// Expiry for a token pair issued now. The provider's own `expires_in` is
    /// ignored in favour of the configured lifetime.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.token_lifetime
    }

    pub fn issue_credential(&self, kind: &str, tokens: TokenPair) -> Credential {
        Credential::issue(kind, tokens, self.expiry_from(Utc::now()))
    }

    pub async fn valid_access_token(
        &self,
        user_id: &str,
        kind: &str,
    ) -> Result<String, ServiceError> {
        self.acquire(user_id, kind)
            .await
            .map(|grant| grant.access_token)
    }

    pub async fn acquire(&self, user_id: &str, kind: &str) -> Result<AccessGrant, ServiceError> {
        let credential = self.load_credential(user_id, kind).await?;
        if credential.is_usable_at(Utc::now()) {
            return Ok(AccessGrant {
                access_token: credential.access_token,
                refreshed: false,
            });
        }

        let key = (user_id.to_string(), kind.to_string());
        let guard = self
            .refresh_guards
            .entry(key.clone())
            .or_default()
            .clone();

        let result = {
            let _singleflight = guard.lock().await;
            self.refresh_locked(&key).await
        };
        drop(guard);

        // Only the map holds the guard once every waiter has finished.
        self.refresh_guards
            .remove_if(&key, |_, held| Arc::strong_count(held) == 1);

        result
    }

    async fn refresh_locked(&self, key: &GuardKey) -> Result<AccessGrant, ServiceError> {
        let (user_id, kind) = (key.0.as_str(), key.1.as_str());
        // Another caller may have refreshed while this one waited on the guard.
        let credential = self.load_credential(user_id, kind).await?;
        if credential.is_usable_at(Utc::now()) {
            tracing::debug!(
                "Credential kind={} for user_id={} was refreshed concurrently",
                kind,
                user_id
            );
            return Ok(AccessGrant {
                access_token: credential.access_token,
                refreshed: false,
            });
        }

        let refresh_failed = || ServiceError::RefreshFailed {
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            source: ProviderError::InvalidGrant,
        };

        // A rejected refresh token is never sent again.
        let already_rejected = self
            .rejected_refresh_tokens
            .get(key)
            .is_some_and(|rejected| *rejected == credential.refresh_token);
        if already_rejected {
            tracing::debug!(
                "Refresh token for kind={} user_id={} was already rejected",
                kind,
                user_id
            );
            return Err(refresh_failed());
        }

        tracing::info!("Refreshing {} token for user_id={}", kind, user_id);

        let tokens = self
            .provider
            .refresh_access_token(&credential.refresh_token)
            .await
            .map_err(|err| match err {
                ProviderError::InvalidGrant => {
                    self.rejected_refresh_tokens
                        .insert(key.clone(), credential.refresh_token.clone());
                    refresh_failed()
                }
                other => ServiceError::Provider(other),
            })
            .inspect_err(|err| {
                tracing::error!("Token refresh failed for user_id={}: {}", user_id, err);
            })?;

        let replacement = self.issue_credential(kind, tokens);
        self.credentials
            .replace_by_kind(user_id, &replacement)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Failed to persist refreshed token for user_id={}: {}",
                    user_id,
                    err
                );
            })?;

        self.rejected_refresh_tokens.remove(key);

        tracing::info!("Successfully refreshed token for user_id={}", user_id);

        Ok(AccessGrant {
            access_token: replacement.access_token,
            refreshed: true,
        })
    }

    async fn load_credential(&self, user_id: &str, kind: &str) -> Result<Credential, ServiceError> {
        let credentials = self.credentials.get(user_id).await?;
        find_credential(&credentials, kind)
            .cloned()
            .ok_or_else(|| ServiceError::NotLinked {
                user_id: user_id.to_string(),
                kind: kind.to_string(),
            })
    }
}
