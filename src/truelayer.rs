use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;

use crate::{
    error::ProviderError,
    provider::{ProviderAccount, ProviderClient, ProviderInfo, ProviderTransaction, TokenPair},
};

const SCOPES: &str =
    "info accounts balance cards transactions direct_debits standing_orders offline_access";
const PROVIDERS: &str = "uk-ob-all uk-oauth-all";
const MOCK_PROVIDER: &str = "uk-cs-mock";

#[derive(Debug, Clone)]
pub struct TrueLayerConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_base_url: Url,
    pub api_base_url: Url,
    pub enable_mock: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse<T> {
    results: Vec<T>,
}

pub struct TrueLayerClient {
    client: reqwest::Client,
    config: TrueLayerConfig,
}

impl TrueLayerClient {
    pub fn new(config: TrueLayerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(TrueLayerClient { client, config })
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenPair, ProviderError> {
        let res = self
            .client
            .post(endpoint(&self.config.auth_base_url, &["connect", "token"]))
            .form(params)
            .send()
            .await
            .map_err(transport_error)?;

        // Bad, expired and revoked grants come back as 400 `invalid_grant`. Other
        // 400s and 401 `invalid_client` are not the user's grant at fault.
        if res.status() == StatusCode::BAD_REQUEST {
            let error = res
                .json::<TokenErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_default();
            tracing::warn!("Token endpoint rejected the request with error={}", &error);
            return Err(if error == "invalid_grant" {
                ProviderError::InvalidGrant
            } else {
                ProviderError::UnexpectedResponse(format!("token endpoint error={}", error))
            });
        }

        let token = decode::<TokenResponse>(res).await?;
        Ok(TokenPair {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        })
    }

    async fn get_results<T: DeserializeOwned>(
        &self,
        access_token: &str,
        segments: &[&str],
    ) -> Result<Vec<T>, ProviderError> {
        let url = endpoint(&self.config.api_base_url, segments);
        let res = self
            .client
            .get(url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport_error)?;

        tracing::debug!("GET {} returned status_code={}", url.path(), res.status());

        decode::<ResultsResponse<T>>(res)
            .await
            .map(|body| body.results)
    }
}

/// Appends percent-encoded path segments to `base`.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    tracing::error!("Error occurred in request to TrueLayer: {}", err);
    ProviderError::Unavailable(err.to_string())
}

fn status_error(status: StatusCode) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Unavailable(status.to_string()),
        status if status.is_server_error() => ProviderError::Unavailable(status.to_string()),
        status => ProviderError::UnexpectedResponse(format!("status_code={}", status)),
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, ProviderError> {
    let status = res.status();
    if !status.is_success() {
        return Err(status_error(status));
    }

    res.json::<T>().await.map_err(|err| {
        tracing::error!("Error occurred while deserialising TrueLayer response: {}", err);
        ProviderError::UnexpectedResponse(err.to_string())
    })
}

#[async_trait]
impl ProviderClient for TrueLayerClient {
    fn authorisation_url(&self, redirect_uri: &str, state: &str) -> String {
        let providers = if self.config.enable_mock {
            format!("{} {}", PROVIDERS, MOCK_PROVIDER)
        } else {
            PROVIDERS.to_string()
        };

        let mut url = self.config.auth_base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", SCOPES)
            .append_pair("nonce", &uuid::Uuid::new_v4().to_string())
            .append_pair("state", state)
            .append_pair("providers", &providers);
        url.into()
    }

    async fn exchange_code_for_token(
        &self,
        redirect_uri: &str,
        code: &str,
    ) -> Result<TokenPair, ProviderError> {
        tracing::info!("Exchanging authorisation code...");
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ])
        .await
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenPair, ProviderError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn get_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        tracing::info!("Listing accounts...");
        self.get_results(access_token, &["data", "v1", "accounts"])
            .await
    }

    async fn get_transactions(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        tracing::info!("Listing transactions for account_id={}", account_id);
        self.get_results(
            access_token,
            &["data", "v1", "accounts", account_id, "transactions"],
        )
        .await
    }

    async fn get_info(&self, access_token: &str) -> Result<ProviderInfo, ProviderError> {
        self.get_results::<ProviderInfo>(access_token, &["data", "v1", "info"])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::UnexpectedResponse("empty info results".to_string()))
    }
}
