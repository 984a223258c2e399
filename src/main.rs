mod args;
mod db;
mod domain;
mod error;
mod handlers;
mod link;
mod logging;
#[cfg(test)]
mod memory;
mod oauth_state;
mod probe;
mod provider;
mod store;
mod sync;
mod tokens;
mod truelayer;

use std::sync::Arc;

use args::parse_args;
use axum::{
    Router,
    routing::{get, post},
};
use db::{PgStore, create_pool};
use handlers::{
    authorise, callback, get_accounts, get_transactions, get_transactions_by_account,
    oauth_redirect_url, probe_provider, sync_user,
};
use link::Linker;
use logging::setup_logging;
use oauth_state::StateSigner;
use probe::Prober;
use provider::ProviderClient;
use store::{CredentialStore, ProjectionStore};
use sync::SyncEngine;
use tokens::TokenManager;
use truelayer::{TrueLayerClient, TrueLayerConfig};

pub struct AppState {
    base_url: String,
    state_signer: StateSigner,
    provider: Arc<dyn ProviderClient>,
    projection: Arc<dyn ProjectionStore>,
    linker: Linker,
    sync: SyncEngine,
    prober: Prober,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/users/{user_id}/sync", post(sync_user))
        .route("/api/users/{user_id}/probe", get(probe_provider))
        .route("/api/users/{user_id}/accounts", get(get_accounts))
        .route("/api/users/{user_id}/transactions", get(get_transactions))
        .route(
            "/api/users/{user_id}/transactions/by-account",
            get(get_transactions_by_account),
        )
        .route("/authorise", get(authorise))
        .route("/oauth/callback", get(callback))
        .route("/", get(|| async { "Hello, World!" }))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    setup_logging(&args.base_log_dir, args.log_level);

    let pool = create_pool(&args.database_url)
        .await
        .expect("Failed to create PostgreSQL pool");

    let store = Arc::new(PgStore::new(pool));
    store
        .migrate()
        .await
        .expect("Failed to run database migrations");

    let state_signer =
        StateSigner::new(args.state_secret.as_deref().unwrap_or(&args.client_secret));

    let provider: Arc<dyn ProviderClient> = Arc::new(
        TrueLayerClient::new(TrueLayerConfig {
            client_id: args.client_id,
            client_secret: args.client_secret,
            auth_base_url: args.auth_base_url,
            api_base_url: args.api_base_url,
            enable_mock: args.enable_mock_provider,
            request_timeout: std::time::Duration::from_secs(args.request_timeout),
        })
        .expect("Failed to build TrueLayer client"),
    );
    let credentials: Arc<dyn CredentialStore> = store.clone();
    let projection: Arc<dyn ProjectionStore> = store;

    let tokens = Arc::new(TokenManager::new(
        credentials.clone(),
        provider.clone(),
        chrono::Duration::seconds(args.access_token_lifetime),
    ));

    let app_state = Arc::new(AppState {
        linker: Linker::new(
            credentials,
            provider.clone(),
            tokens.clone(),
            &args.provider_kind,
            &oauth_redirect_url(&args.base_url),
        ),
        sync: SyncEngine::new(
            tokens.clone(),
            provider.clone(),
            projection.clone(),
            &args.provider_kind,
            args.sync_concurrency,
        ),
        prober: Prober::new(tokens, provider.clone(), &args.provider_kind),
        base_url: args.base_url,
        state_signer,
        provider,
        projection,
    });

    let app = router(app_state);

    let bind_address = format! {"0.0.0.0:{}", args.port};
    tracing::info!("Server listening on {}...", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
