use std::{collections::BTreeMap, sync::Arc};

use crate::{
    AppState,
    domain::{Account, Transaction},
    error::{ServiceError, StorageError},
    probe::ProbeReport,
    sync::SyncReport,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

#[derive(Debug, Deserialize)]
pub struct AuthoriseParams {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug)]
pub enum AppError {
    Service(ServiceError),
    BadRequest(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        AppError::Service(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Service(ServiceError::Storage(err))
    }
}

fn authorise_path(user_id: &str) -> String {
    let path = String::from("/authorise?");
    let query_start = path.len();
    form_urlencoded::Serializer::for_suffix(path, query_start)
        .append_pair("user_id", user_id)
        .finish()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Service(
                ServiceError::NotLinked { user_id, .. }
                | ServiceError::RefreshFailed { user_id, .. },
            ) => {
                tracing::info!("Sending user_id={} through authorisation", &user_id);
                return Redirect::to(&authorise_path(&user_id)).into_response();
            }
            AppError::Service(ServiceError::Storage(StorageError::UnknownUser(user_id))) => (
                StatusCode::NOT_FOUND,
                format!("User {} not found", user_id),
            ),
            AppError::Service(ServiceError::Provider(err)) => (
                StatusCode::BAD_GATEWAY,
                format!("Provider request failed: {}", err),
            ),
            AppError::Service(ServiceError::Storage(err)) => {
                tracing::error!("Storage error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::BadRequest(msg) => {
                tracing::info!("Bad request: {}", &msg);
                (StatusCode::BAD_REQUEST, msg)
            }
        };

        (
            status,
            Json(serde_json::json!({ "message": error_message })),
        )
            .into_response()
    }
}

pub fn oauth_redirect_url(base_url: &str) -> String {
    format!("{}/oauth/callback", base_url)
}

pub async fn authorise(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthoriseParams>,
) -> Redirect {
    let oauth_state = params
        .user_id
        .filter(|user_id| !user_id.is_empty())
        .map(|user_id| state.state_signer.sign(&user_id))
        .unwrap_or_default();

    let redirect_url = state
        .provider
        .authorisation_url(&oauth_redirect_url(&state.base_url), &oauth_state);

    tracing::info!("Redirecting to {}", &redirect_url);

    Redirect::to(&redirect_url)
}

pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, AppError> {
    if let Some(error) = params.error {
        return Err(AppError::BadRequest(format!(
            "Authorisation was not granted: {}",
            error
        )));
    }

    let code = params.code.ok_or(AppError::BadRequest(String::from(
        "No authorisation code received",
    )))?;

    if code.is_empty() {
        return Err(AppError::BadRequest(String::from(
            "Empty authorisation code received",
        )));
    }

    let principal = match params.state.as_deref() {
        None | Some("") => None,
        Some(oauth_state) => Some(state.state_signer.verify(oauth_state).ok_or_else(|| {
            AppError::BadRequest(String::from("Invalid state parameter received"))
        })?),
    };

    let outcome = state
        .linker
        .link_account(principal.as_deref(), &code)
        .await?;

    // Linking already succeeded; a failed first sync is only logged.
    match state.sync.sync_user(&outcome.user_id).await {
        Ok(report) => tracing::info!(
            "Initial sync for user_id={} finished with status={:?}",
            &outcome.user_id,
            report.status
        ),
        Err(err) => tracing::warn!(
            "Initial sync for user_id={} could not run: {}",
            &outcome.user_id,
            err
        ),
    }

    let redirect_url = format!("{}/", &state.base_url);

    tracing::info!("Redirecting to {}", &redirect_url);

    Ok(Redirect::to(&redirect_url))
}

#[axum::debug_handler]
pub async fn sync_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<SyncReport>>, AppError> {
    let report = state
        .sync
        .sync_user(&user_id)
        .await
        .inspect_err(|err| {
            if !err.requires_authorisation() {
                tracing::error!("Sync could not start for user_id={}: {}", &user_id, err);
            }
        })?;

    Ok(Json(DataResponse { data: report }))
}

#[axum::debug_handler]
pub async fn probe_provider(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<DataResponse<ProbeReport>> {
    Json(DataResponse {
        data: state.prober.probe_provider(&user_id).await,
    })
}

#[axum::debug_handler]
pub async fn get_accounts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<Vec<Account>>>, AppError> {
    let accounts = state
        .projection
        .accounts_for_user(&user_id)
        .await
        .inspect_err(|err| tracing::error!("Error querying accounts in get_accounts: {}", err))?;

    Ok(Json(DataResponse { data: accounts }))
}

#[axum::debug_handler]
pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<Vec<Transaction>>>, AppError> {
    let transactions = state
        .projection
        .transactions_for_user(&user_id)
        .await
        .inspect_err(|err| {
            tracing::error!("Error querying transactions in get_transactions: {}", err)
        })?;

    Ok(Json(DataResponse { data: transactions }))
}

#[axum::debug_handler]
pub async fn get_transactions_by_account(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<BTreeMap<String, Vec<Transaction>>>>, AppError> {
    let transactions = state.projection.transactions_for_user(&user_id).await?;

    let mut grouped: BTreeMap<String, Vec<Transaction>> = BTreeMap::new();
    for transaction in transactions {
        grouped
            .entry(transaction.account_id.clone())
            .or_default()
            .push(transaction);
    }

    Ok(Json(DataResponse { data: grouped }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use chrono::{Duration, Utc};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        domain::Credential,
        error::ProviderError,
        link::Linker,
        memory::{MemoryCredentialStore, MemoryProjectionStore},
        oauth_state::StateSigner,
        probe::Prober,
        provider::{MockProviderClient, ProviderClient, ProviderTransaction, TokenPair},
        router,
        store::{CredentialStore, ProjectionStore},
        sync::SyncEngine,
        tokens::TokenManager,
    };

    const KIND: &str = "truelayer";
    const BASE_URL: &str = "https://banklink.example.com";

    fn linked_credentials() -> MemoryCredentialStore {
        MemoryCredentialStore::default()
            .with_user(
                "u1",
                "u1@example.com",
                vec![Credential {
                    kind: KIND.to_string(),
                    access_token: "a1".to_string(),
                    refresh_token: "r1".to_string(),
                    access_token_expires_at: Utc::now() + Duration::hours(1),
                }],
            )
            .with_user("u2", "u2@example.com", vec![])
    }

    fn app_state(
        credentials: Arc<MemoryCredentialStore>,
        projection: Arc<MemoryProjectionStore>,
        provider: MockProviderClient,
    ) -> Arc<AppState> {
        let credentials: Arc<dyn CredentialStore> = credentials;
        let projection: Arc<dyn ProjectionStore> = projection;
        let provider: Arc<dyn ProviderClient> = Arc::new(provider);
        let tokens = Arc::new(TokenManager::new(
            credentials.clone(),
            provider.clone(),
            Duration::hours(1),
        ));
        Arc::new(AppState {
            base_url: BASE_URL.to_string(),
            state_signer: StateSigner::new("state-secret"),
            provider: provider.clone(),
            projection: projection.clone(),
            linker: Linker::new(
                credentials,
                provider.clone(),
                tokens.clone(),
                KIND,
                &oauth_redirect_url(BASE_URL),
            ),
            sync: SyncEngine::new(tokens.clone(), provider.clone(), projection, KIND, 2),
            prober: Prober::new(tokens, provider, KIND),
        })
    }

    fn syncing_provider() -> MockProviderClient {
        let mut provider = MockProviderClient::new();
        provider.expect_get_accounts().returning(|_| {
            Ok(vec![serde_json::from_value(json!({
                "account_id": "A1",
                "currency": "GBP",
                "display_name": "Current"
            }))
            .expect("account")])
        });
        provider.expect_get_transactions().returning(|_, _| {
            Ok(["T1", "T2"]
                .iter()
                .map(|id| ProviderTransaction {
                    transaction_id: id.to_string(),
                    timestamp: Utc::now(),
                    description: "COFFEE".to_string(),
                    amount: -3.2,
                    currency: "GBP".to_string(),
                    transaction_type: None,
                    transaction_category: None,
                    meta: Value::Null,
                })
                .collect())
        });
        provider
    }

    async fn send(
        state: Arc<AppState>,
        method: &str,
        uri: &str,
    ) -> (StatusCode, Option<String>, Value) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|value| value.to_str().expect("location").to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, location, body)
    }

    #[tokio::test]
    async fn sync_returns_the_report() {
        let projection = Arc::new(MemoryProjectionStore::default());
        let state = app_state(
            Arc::new(linked_credentials()),
            projection.clone(),
            syncing_provider(),
        );

        let (status, _, body) = send(state.clone(), "POST", "/api/users/u1/sync").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "complete");
        assert_eq!(body["data"]["transactions"], 2);

        let (_, _, body) = send(state, "GET", "/api/users/u1/transactions/by-account").await;
        assert_eq!(body["data"]["A1"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn unlinked_user_is_redirected_to_authorise() {
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            MockProviderClient::new(),
        );

        let (status, location, _) = send(state, "POST", "/api/users/u2/sync").await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("/authorise?user_id=u2"));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            MockProviderClient::new(),
        );

        let (status, _, _) = send(state, "POST", "/api/users/ghost/sync").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn provider_outage_is_a_bad_gateway() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_get_accounts()
            .returning(|_| Err(ProviderError::Unavailable("timed out".to_string())));
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            provider,
        );

        let (status, _, body) = send(state, "POST", "/api/users/u1/sync").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["message"].as_str().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn authorise_redirects_to_the_provider() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_authorisation_url()
            .withf(|redirect_uri, state| {
                redirect_uri == "https://banklink.example.com/oauth/callback"
                    && StateSigner::new("state-secret").verify(state).as_deref() == Some("u1")
            })
            .returning(|_, _| "https://auth.example.com/".to_string());
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            provider,
        );

        let (status, location, _) = send(state, "GET", "/authorise?user_id=u1").await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("https://auth.example.com/"));
    }

    #[tokio::test]
    async fn callback_without_code_is_rejected() {
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            MockProviderClient::new(),
        );

        let (status, _, body) = send(state, "GET", "/oauth/callback?state=u2").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "No authorisation code received");
    }

    #[tokio::test]
    async fn callback_links_and_runs_the_first_sync() {
        let credentials = Arc::new(linked_credentials());
        let projection = Arc::new(MemoryProjectionStore::default());
        let mut provider = syncing_provider();
        provider
            .expect_exchange_code_for_token()
            .times(1)
            .returning(|_, _| {
                Ok(TokenPair {
                    access_token: "fresh".to_string(),
                    refresh_token: "fresh-refresh".to_string(),
                })
            });
        let state = app_state(credentials.clone(), projection.clone(), provider);
        let uri = format!(
            "/oauth/callback?code=abc&state={}",
            state.state_signer.sign("u2")
        );

        let (status, location, _) = send(state, "GET", &uri).await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("https://banklink.example.com/"));
        assert_eq!(credentials.credentials_of("u2")[0].access_token, "fresh");
        assert_eq!(projection.transaction_count(), 2);
    }

    #[tokio::test]
    async fn probe_always_answers() {
        let state = app_state(
            Arc::new(linked_credentials()),
            Arc::new(MemoryProjectionStore::default()),
            MockProviderClient::new(),
        );

        let (status, _, body) = send(state, "GET", "/api/users/u2/probe").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["access_token_valid"], false);
        assert_eq!(body["data"]["message"], "truelayer is not linked");
    }

    #[tokio::test]
    async fn callback_with_unsigned_state_is_rejected() {
        let credentials = Arc::new(linked_credentials());
        let mut provider = MockProviderClient::new();
        provider.expect_exchange_code_for_token().never();
        let state = app_state(
            credentials.clone(),
            Arc::new(MemoryProjectionStore::default()),
            provider,
        );

        let (status, _, body) = send(state, "GET", "/oauth/callback?code=abc&state=u1").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid state parameter received");
        assert_eq!(credentials.credentials_of("u1")[0].access_token, "a1");
    }

    #[tokio::test]
    async fn failed_first_sync_still_completes_the_link() {
        let credentials = Arc::new(linked_credentials());
        let mut provider = MockProviderClient::new();
        provider.expect_exchange_code_for_token().returning(|_, _| {
            Ok(TokenPair {
                access_token: "fresh".to_string(),
                refresh_token: "fresh-refresh".to_string(),
            })
        });
        provider
            .expect_get_accounts()
            .returning(|_| Err(ProviderError::Unavailable("timed out".to_string())));
        let state = app_state(
            credentials.clone(),
            Arc::new(MemoryProjectionStore::default()),
            provider,
        );
        let uri = format!(
            "/oauth/callback?code=abc&state={}",
            state.state_signer.sign("u2")
        );

        let (status, location, _) = send(state, "GET", &uri).await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("https://banklink.example.com/"));
        assert_eq!(credentials.credentials_of("u2")[0].access_token, "fresh");
    }

    #[test]
    fn authorise_path_starts_the_query_cleanly() {
        assert_eq!(authorise_path("u 2"), "/authorise?user_id=u+2");
    }
}
