//! Accounts service REST client using the service key

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::game::rewards::AccountSink;
use crate::game::ParticipantId;

/// Client for the external accounts service that holds participant balances
#[derive(Clone)]
pub struct AccountsClient {
    client: Client,
    base_url: String,
    service_key: String,
}

/// Body of `POST /rewards/credit`
#[derive(Debug, Clone, Serialize)]
pub struct CreditRequest {
    pub participant_id: ParticipantId,
    pub amount: f64,
}

impl AccountsClient {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }
    }

    fn credit_url(&self) -> String {
        format!("{}/rewards/credit", self.base_url)
    }

    /// Add `amount` to a participant's balance
    pub async fn credit(&self, request: &CreditRequest) -> Result<(), AccountsError> {
        let response = self
            .client
            .post(self.credit_url())
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(AccountsError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AccountsError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Credits balances through the accounts service without blocking the tick.
/// The reward ledger is already written when this runs, so a failed call is only logged.
pub struct HttpAccounts {
    client: Arc<AccountsClient>,
}

impl HttpAccounts {
    pub fn new(client: AccountsClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl AccountSink for HttpAccounts {
    fn credit_reward(&self, participant_id: ParticipantId, amount: f64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(participant_id = %participant_id, amount, "No runtime to credit reward on");
            return;
        };
        let client = self.client.clone();
        runtime.spawn(async move {
            let request = CreditRequest {
                participant_id,
                amount,
            };
            if let Err(e) = client.credit(&request).await {
                warn!(participant_id = %participant_id, amount, error = %e, "Failed to credit reward");
            }
        });
    }
}

/// Used when no accounts service is configured
pub struct LogAccounts;

impl AccountSink for LogAccounts {
    fn credit_reward(&self, participant_id: ParticipantId, amount: f64) {
        info!(participant_id = %participant_id, amount, "Reward credited (no accounts service)");
    }
}

/// Accounts service errors
#[derive(Debug, thiserror::Error)]
pub enum AccountsError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}
