//! Reward application with at-most-once semantics per (participant, boundary key)

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ParticipantId;

/// Identifies the boundary a reward belongs to (`warmup`, `round:3`, `match`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardKey(String);

impl RewardKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn warmup() -> Self {
        Self::new("warmup")
    }

    pub fn round(round_index: u32) -> Self {
        Self(format!("round:{}", round_index))
    }

    pub fn match_end() -> Self {
        Self::new("match")
    }
}

impl fmt::Display for RewardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardLedgerEntry {
    pub participant_id: ParticipantId,
    pub key: RewardKey,
    pub amount: f64,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

/// Account-balance collaborator. Must not block: the tick calls it inline.
pub trait AccountSink: Send + Sync {
    fn credit_reward(&self, participant_id: ParticipantId, amount: f64);
}

/// Ledger-backed reward gateway shared by the phase machine, the survival controller
/// and the disconnect hook
pub struct RewardGateway {
    ledger: DashMap<(ParticipantId, RewardKey), RewardLedgerEntry>,
    /// Rewards already earned but not yet paid, settled when the participant leaves
    pending: DashMap<(ParticipantId, RewardKey), f64>,
    accounts: Arc<dyn AccountSink>,
}

impl RewardGateway {
    pub fn new(accounts: Arc<dyn AccountSink>) -> Self {
        Self {
            ledger: DashMap::new(),
            pending: DashMap::new(),
            accounts,
        }
    }

    /// Rebuild a gateway from persisted ledger entries (crash-recovery replay)
    pub fn restore(accounts: Arc<dyn AccountSink>, entries: Vec<RewardLedgerEntry>) -> Self {
        let gateway = Self::new(accounts);
        for entry in entries {
            gateway
                .ledger
                .insert((entry.participant_id, entry.key.clone()), entry);
        }
        gateway
    }

    /// Record and credit a reward unless this (participant, key) pair was already paid.
    /// The ledger entry is written before the account collaborator is notified.
    pub fn apply(&self, participant_id: ParticipantId, key: &RewardKey, amount: f64) -> ApplyOutcome {
        let outcome = match self.ledger.entry((participant_id, key.clone())) {
            Entry::Occupied(_) => ApplyOutcome::AlreadyApplied,
            Entry::Vacant(slot) => {
                slot.insert(RewardLedgerEntry {
                    participant_id,
                    key: key.clone(),
                    amount,
                    applied_at: Utc::now(),
                });
                ApplyOutcome::Applied
            }
        };
        self.pending.remove(&(participant_id, key.clone()));

        match outcome {
            ApplyOutcome::Applied => {
                info!(participant_id = %participant_id, key = %key, amount, "Reward applied");
                if amount > 0.0 {
                    self.accounts.credit_reward(participant_id, amount);
                }
            }
            ApplyOutcome::AlreadyApplied => {
                debug!(participant_id = %participant_id, key = %key, "Reward already applied, skipping");
            }
        }
        outcome
    }

    /// Remember an earned amount so the disconnect hook can settle it. Restaging the same
    /// key replaces the previous amount.
    pub fn stage(&self, participant_id: ParticipantId, key: &RewardKey, amount: f64) {
        if self.is_applied(participant_id, key) {
            return;
        }
        self.pending.insert((participant_id, key.clone()), amount);
    }

    /// Disconnect hook: settle every staged reward for the participant
    pub fn on_participant_left(&self, participant_id: ParticipantId) -> Vec<(RewardKey, f64, ApplyOutcome)> {
        let staged: Vec<(RewardKey, f64)> = self
            .pending
            .iter()
            .filter(|entry| entry.key().0 == participant_id)
            .map(|entry| (entry.key().1.clone(), *entry.value()))
            .collect();

        staged
            .into_iter()
            .map(|(key, amount)| {
                let outcome = self.apply(participant_id, &key, amount);
                (key, amount, outcome)
            })
            .collect()
    }

    pub fn is_applied(&self, participant_id: ParticipantId, key: &RewardKey) -> bool {
        self.ledger.contains_key(&(participant_id, key.clone()))
    }

    #[cfg(test)]
    pub fn pending_amount(&self, participant_id: ParticipantId, key: &RewardKey) -> Option<f64> {
        self.pending
            .get(&(participant_id, key.clone()))
            .map(|amount| *amount)
    }

    /// Ledger contents, oldest first
    pub fn entries(&self) -> Vec<RewardLedgerEntry> {
        let mut entries: Vec<RewardLedgerEntry> =
            self.ledger.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.applied_at.cmp(&b.applied_at));
        entries
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingAccounts;
    use super::*;
    use uuid::Uuid;

    fn gateway() -> (RewardGateway, Arc<RecordingAccounts>) {
        let accounts = Arc::new(RecordingAccounts::default());
        (RewardGateway::new(accounts.clone()), accounts)
    }

    #[test]
    fn second_apply_is_a_no_op() {
        let (gateway, accounts) = gateway();
        let p1 = Uuid::new_v4();
        let key = RewardKey::round(0);

        assert_eq!(gateway.apply(p1, &key, 100.0), ApplyOutcome::Applied);
        assert_eq!(gateway.apply(p1, &key, 100.0), ApplyOutcome::AlreadyApplied);

        assert_eq!(gateway.len(), 1);
        assert_eq!(accounts.credits_for(p1), vec![100.0]);
    }

    #[test]
    fn explicit_end_then_disconnect_credits_once() {
        let (gateway, accounts) = gateway();
        let p1 = Uuid::new_v4();
        let key = RewardKey::new("round:0");

        gateway.stage(p1, &key, 100.0);
        assert_eq!(gateway.apply(p1, &key, 100.0), ApplyOutcome::Applied);
        // staged reward was settled by the explicit application
        assert!(gateway.on_participant_left(p1).is_empty());
        assert_eq!(gateway.apply(p1, &key, 100.0), ApplyOutcome::AlreadyApplied);

        assert_eq!(accounts.credits_for(p1), vec![100.0]);
    }

    #[test]
    fn disconnect_settles_staged_rewards_first() {
        let (gateway, accounts) = gateway();
        let p1 = Uuid::new_v4();
        let key = RewardKey::round(2);

        gateway.stage(p1, &key, 40.0);
        gateway.stage(p1, &key, 80.0);
        let settled = gateway.on_participant_left(p1);
        assert_eq!(settled, vec![(key.clone(), 80.0, ApplyOutcome::Applied)]);

        // round end fires later for the same participant
        assert_eq!(gateway.apply(p1, &key, 120.0), ApplyOutcome::AlreadyApplied);
        assert_eq!(accounts.credits_for(p1), vec![80.0]);
    }

    #[test]
    fn keys_and_participants_are_independent() {
        let (gateway, accounts) = gateway();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();

        assert_eq!(gateway.apply(p1, &RewardKey::round(0), 10.0), ApplyOutcome::Applied);
        assert_eq!(gateway.apply(p1, &RewardKey::round(1), 20.0), ApplyOutcome::Applied);
        assert_eq!(gateway.apply(p2, &RewardKey::round(0), 10.0), ApplyOutcome::Applied);
        assert_eq!(gateway.len(), 3);
        assert_eq!(accounts.credits.lock().len(), 3);
    }

    #[test]
    fn zero_rewards_are_recorded_but_not_credited() {
        let (gateway, accounts) = gateway();
        let p1 = Uuid::new_v4();
        assert_eq!(gateway.apply(p1, &RewardKey::warmup(), 0.0), ApplyOutcome::Applied);
        assert!(gateway.is_applied(p1, &RewardKey::warmup()));
        assert!(accounts.credits.lock().is_empty());
    }

    #[test]
    fn restored_ledger_blocks_replayed_rewards() {
        let (gateway, _) = gateway();
        let p1 = Uuid::new_v4();
        gateway.apply(p1, &RewardKey::match_end(), 55.0);
        let persisted = serde_json::to_string(&gateway.entries()).unwrap();

        let accounts = Arc::new(RecordingAccounts::default());
        let entries: Vec<RewardLedgerEntry> = serde_json::from_str(&persisted).unwrap();
        let recovered = RewardGateway::restore(accounts.clone(), entries);
        assert_eq!(
            recovered.apply(p1, &RewardKey::match_end(), 55.0),
            ApplyOutcome::AlreadyApplied
        );
        assert!(accounts.credits.lock().is_empty());
    }

    #[test]
    fn concurrent_triggers_apply_once() {
        let accounts = Arc::new(RecordingAccounts::default());
        let gateway = Arc::new(RewardGateway::new(accounts.clone()));
        let p1 = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                std::thread::spawn(move || gateway.apply(p1, &RewardKey::round(0), 100.0))
            })
            .collect();
        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == ApplyOutcome::Applied)
            .count();

        assert_eq!(applied, 1);
        assert_eq!(accounts.credits_for(p1), vec![100.0]);
    }
}
