use std::sync::Arc;

use crate::{
    error::{ProviderError, ServiceError},
    provider::ProviderClient,
    store::CredentialStore,
    tokens::TokenManager,
};

#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    pub user_id: String,
    pub created_user: bool,
}

/// Turns an authorisation code into a stored credential, resolving which
/// local user it belongs to.
pub struct Linker {
    credentials: Arc<dyn CredentialStore>,
    provider: Arc<dyn ProviderClient>,
    tokens: Arc<TokenManager>,
    kind: String,
    redirect_uri: String,
}

impl Linker {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        provider: Arc<dyn ProviderClient>,
        tokens: Arc<TokenManager>,
        kind: &str,
        redirect_uri: &str,
    ) -> Self {
        Linker {
            credentials,
            provider,
            tokens,
            kind: kind.to_string(),
            redirect_uri: redirect_uri.to_string(),
        }
    }

    /// With a principal the credential is attached to that user. Without one
    /// the provider identity's first email picks an existing user or a new one
    /// is created.
    pub async fn link_account(
        &self,
        principal: Option<&str>,
        code: &str,
    ) -> Result<LinkOutcome, ServiceError> {
        let tokens = self
            .provider
            .exchange_code_for_token(&self.redirect_uri, code)
            .await
            .inspect_err(|err| tracing::error!("Authorisation code exchange failed: {}", err))?;

        let outcome = match principal {
            Some(user_id) => LinkOutcome {
                user_id: user_id.to_string(),
                created_user: false,
            },
            None => self.resolve_identity(&tokens.access_token).await?,
        };

        let credential = self.tokens.issue_credential(&self.kind, tokens);
        self.credentials
            .replace_by_kind(&outcome.user_id, &credential)
            .await?;

        tracing::info!(
            "Linked {} for user_id={} created_user={}",
            &self.kind,
            &outcome.user_id,
            outcome.created_user
        );

        Ok(outcome)
    }

    async fn resolve_identity(&self, access_token: &str) -> Result<LinkOutcome, ServiceError> {
        let info = self.provider.get_info(access_token).await?;
        // Only the first email the provider reports is used to match users.
        let email = info.emails.first().ok_or_else(|| {
            ProviderError::UnexpectedResponse("identity has no email address".to_string())
        })?;

        if let Some(user_id) = self.credentials.find_user_by_email(email).await? {
            return Ok(LinkOutcome {
                user_id,
                created_user: false,
            });
        }

        let user_id = self.credentials.create_user(email, &info.full_name).await?;
        Ok(LinkOutcome {
            user_id,
            created_user: true,
        })
    }
}
