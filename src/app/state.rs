//! Application state shared across routes

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::{Config, MatchConfig};
use crate::game::rewards::{AccountSink, RewardGateway, RewardLedgerEntry};
use crate::game::{GameMatch, MatchError, MatchHandle, MatchRegistry};
use crate::store::{AccountsClient, HttpAccounts, LogAccounts};
use crate::ws::protocol::MatchEvent;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub match_config: Arc<MatchConfig>,
    pub accounts: Arc<dyn AccountSink>,
    pub match_registry: Arc<MatchRegistry>,
}

impl AppState {
    pub fn new(config: Config, match_config: MatchConfig) -> Self {
        let accounts: Arc<dyn AccountSink> = match (&config.accounts_url, &config.accounts_service_key) {
            (Some(url), Some(key)) => {
                info!(accounts_url = %url, "Crediting rewards through the accounts service");
                Arc::new(HttpAccounts::new(AccountsClient::new(url.clone(), key.clone())))
            }
            _ => {
                info!("No accounts service configured, rewards are only logged");
                Arc::new(LogAccounts)
            }
        };

        Self {
            config: Arc::new(config),
            match_config: Arc::new(match_config),
            accounts,
            match_registry: Arc::new(MatchRegistry::new()),
        }
    }

    /// Create a match session, register it and spawn its tick loop. A previously
    /// exported ledger is restored so rewards it records are never applied twice.
    pub fn open_match(&self, ledger: Vec<RewardLedgerEntry>) -> Result<MatchHandle, MatchError> {
        let match_id = Uuid::new_v4();
        let seed = rand::random::<u64>();

        let restored = ledger.len();
        let rewards = Arc::new(RewardGateway::restore(self.accounts.clone(), ledger));
        let (mut game_match, handle) = GameMatch::new(match_id, seed, self.match_config.clone(), rewards)?;
        game_match.subscribe(Box::new(move |tick, event| audit_event(match_id, tick, event)));

        // Register match
        self.match_registry.insert(handle.clone());

        info!(
            match_id = %match_id,
            mode = ?self.match_config.mode,
            seed,
            restored_rewards = restored,
            "Created new match"
        );

        // Spawn match task
        let registry = self.match_registry.clone();
        tokio::spawn(async move {
            game_match.run().await;

            // Cleanup after match ends
            registry.remove(&match_id);
            info!(match_id = %match_id, "Match removed from registry");
        });

        Ok(handle)
    }
}

/// Durable outcomes go to the audit log target
fn audit_event(match_id: Uuid, tick: u64, event: &MatchEvent) {
    match event {
        MatchEvent::MatchEnded { outcome } => {
            info!(target: "audit", match_id = %match_id, tick, outcome = ?outcome, "Match ended");
        }
        MatchEvent::RewardApplied {
            participant_id,
            key,
            amount,
        } => {
            info!(
                target: "audit",
                match_id = %match_id,
                tick,
                participant_id = %participant_id,
                key = %key,
                amount,
                "Reward applied"
            );
        }
        MatchEvent::ParticipantKicked { participant_id, reason } => {
            info!(target: "audit", match_id = %match_id, tick, participant_id = %participant_id, reason = %reason, "Participant kicked");
        }
        _ => {}
    }
}
