//! Team/roster collaborator and team balancing

use std::sync::Arc;

use crate::config::{GameMode, MatchConfig};

use super::{Participant, Team};

/// Read-only roster settings the lifecycle consults
pub trait Roster: Send + Sync {
    fn min_participants_to_start(&self) -> usize;
    fn respawn_period_secs(&self, team: Team) -> f32;
}

/// Roster backed by the static match configuration
#[derive(Clone)]
pub struct ConfiguredRoster {
    config: Arc<MatchConfig>,
}

impl ConfiguredRoster {
    pub fn new(config: Arc<MatchConfig>) -> Self {
        Self { config }
    }
}

impl Roster for ConfiguredRoster {
    fn min_participants_to_start(&self) -> usize {
        self.config.min_participants_to_start
    }

    fn respawn_period_secs(&self, team: Team) -> f32 {
        *self.config.respawn_period_secs.get(team)
    }
}

/// Team a newly joining participant is placed on
pub fn assign_team(mode: GameMode, participants: &[&Participant]) -> Team {
    match mode {
        GameMode::Survival => Team::Defenders,
        GameMode::Skirmish => {
            let attackers = participants.iter().filter(|p| p.team == Team::Attackers).count();
            let defenders = participants.len() - attackers;
            if attackers < defenders {
                Team::Attackers
            } else {
                Team::Defenders
            }
        }
    }
}

/// Reassign teams by join order. Survival puts everyone on defence; skirmish alternates
/// so team sizes never differ by more than one.
pub fn rebalance(mode: GameMode, participants: &mut [&mut Participant]) {
    participants.sort_by_key(|p| (p.joined_tick, p.id));
    for (index, participant) in participants.iter_mut().enumerate() {
        participant.team = match mode {
            GameMode::Survival => Team::Defenders,
            GameMode::Skirmish if index % 2 == 0 => Team::Defenders,
            GameMode::Skirmish => Team::Attackers,
        };
    }
}
