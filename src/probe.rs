//! Health check of a user's provider connection. Nothing here is persisted and
//! no failure is ever raised to the caller.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{ProviderError, ServiceError},
    provider::ProviderClient,
    tokens::TokenManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeEndpoint {
    Info,
    Accounts,
    Transactions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeCall {
    pub endpoint: ProbeEndpoint,
    pub latency_ms: u64,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub user_id: String,
    pub kind: String,
    pub access_token_valid: bool,
    pub refresh_token_valid: bool,
    pub calls: Vec<ProbeCall>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct Prober {
    tokens: Arc<TokenManager>,
    provider: Arc<dyn ProviderClient>,
    kind: String,
}

async fn timed<T, F>(endpoint: ProbeEndpoint, call: F) -> (ProbeCall, Option<T>)
where
    F: Future<Output = Result<T, ProviderError>>,
{
    let started = Instant::now();
    let result = call.await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (outcome, value) = match result {
        Ok(value) => (ProbeOutcome::Ok, Some(value)),
        Err(err) => (
            ProbeOutcome::Failed {
                error: err.to_string(),
            },
            None,
        ),
    };
    (
        ProbeCall {
            endpoint,
            latency_ms,
            outcome,
        },
        value,
    )
}

impl Prober {
    pub fn new(tokens: Arc<TokenManager>, provider: Arc<dyn ProviderClient>, kind: &str) -> Self {
        Prober {
            tokens,
            provider,
            kind: kind.to_string(),
        }
    }

    pub async fn probe_provider(&self, user_id: &str) -> ProbeReport {
        let mut report = ProbeReport {
            user_id: user_id.to_string(),
            kind: self.kind.clone(),
            access_token_valid: false,
            refresh_token_valid: false,
            calls: Vec::new(),
            message: None,
            created_at: Utc::now(),
        };

        let grant = match self.tokens.acquire(user_id, &self.kind).await {
            Ok(grant) => grant,
            Err(err) => {
                tracing::warn!("Probe for user_id={} has no token: {}", user_id, err);
                report.message = Some(match err {
                    ServiceError::NotLinked { .. } => format!("{} is not linked", self.kind),
                    other => other.to_string(),
                });
                return report;
            }
        };
        report.access_token_valid = !grant.refreshed;
        report.refresh_token_valid = true;
        let access_token = grant.access_token;

        let (call, _) = timed(ProbeEndpoint::Info, self.provider.get_info(&access_token)).await;
        report.calls.push(call);

        let (call, accounts) = timed(
            ProbeEndpoint::Accounts,
            self.provider.get_accounts(&access_token),
        )
        .await;
        report.calls.push(call);

        if let Some(account) = accounts.as_ref().and_then(|accounts| accounts.first()) {
            let (call, _) = timed(
                ProbeEndpoint::Transactions,
                self.provider
                    .get_transactions(&access_token, &account.account_id),
            )
            .await;
            report.calls.push(call);
        }

        tracing::info!(
            "Probe for user_id={} made {} calls, {} failed",
            user_id,
            report.calls.len(),
            report
                .calls
                .iter()
                .filter(|call| call.outcome != ProbeOutcome::Ok)
                .count()
        );

        report
    }
}
