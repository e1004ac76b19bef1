//! Match phase state machine: waiting → warmup → active play → end
//!
//! The machine owns its phase and countdown outright. The session host feeds it one
//! [`PhaseInputs`] per tick and carries out the [`PhaseEffect`]s of each transition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{GameMode, MatchConfig};

use super::r#match::MatchError;
use super::roster::Roster;
use super::spawn::eligibility::PolicyContext;
use super::spawn::{SpawnBehaviorRegistry, SpawnPolicy};
use super::timer::Countdown;
use super::MatchOutcome;

const WARMUP_BEHAVIOR: &str = "warmup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    WaitingForParticipants,
    WarmupActive,
    WarmupEnding,
    WarmupEnded,
    MatchActive,
    MatchEnding,
}

impl Phase {
    pub fn is_warmup(&self) -> bool {
        matches!(self, Phase::WarmupActive | Phase::WarmupEnding)
    }
}

/// What the host observed this tick
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseInputs {
    pub now_tick: u64,
    pub participants: usize,
    /// Every participant is ready, or the engine forced a start
    pub early_start: bool,
    /// Result reported by the active progression logic
    pub outcome: Option<MatchOutcome>,
}

/// Work the host performs when a transition fires
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhaseEffect {
    /// Despawn every body and unit and forget spawn history
    ResetSimulation,
    RebalanceTeams,
    FinalizeWarmupRewards,
    BeginProgression,
    EndProgression(MatchOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub start_tick: u64,
    /// Countdown length announced with the phase; zero when the phase is open-ended
    pub duration_secs: f32,
    pub effects: Vec<PhaseEffect>,
}

pub struct PhaseMachine {
    config: Arc<MatchConfig>,
    roster: Arc<dyn Roster>,
    behaviors: SpawnBehaviorRegistry,
    phase: Phase,
    countdown: Option<Countdown>,
    spawn_policy: Option<SpawnPolicy>,
    warmup_started_tick: Option<u64>,
    warmup_closed_tick: Option<u64>,
    outcome: Option<MatchOutcome>,
}

impl PhaseMachine {
    pub fn new(
        config: Arc<MatchConfig>,
        roster: Arc<dyn Roster>,
        behaviors: SpawnBehaviorRegistry,
    ) -> Self {
        Self {
            config,
            roster,
            behaviors,
            phase: Phase::WaitingForParticipants,
            countdown: None,
            spawn_policy: None,
            warmup_started_tick: None,
            warmup_closed_tick: None,
            outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn countdown(&self) -> Option<Countdown> {
        self.countdown
    }

    pub fn spawn_policy(&self) -> Option<&SpawnPolicy> {
        self.spawn_policy.as_ref()
    }

    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.outcome
    }

    /// Ticks during which warmup play counted for rewards
    pub fn warmup_window(&self, now_tick: u64) -> Option<(u64, u64)> {
        self.warmup_started_tick
            .map(|start| (start, self.warmup_closed_tick.unwrap_or(now_tick)))
    }

    /// The session can close once the end-of-match linger ran out
    pub fn is_finished(&self, now_tick: u64) -> bool {
        self.phase == Phase::MatchEnding
            && self
                .countdown
                .map(|c| c.has_expired(now_tick))
                .unwrap_or(true)
    }

    /// Advance by one tick. At most one transition fires per tick.
    pub fn tick(&mut self, inputs: PhaseInputs) -> Result<Option<PhaseTransition>, MatchError> {
        let now = inputs.now_tick;
        let expired = self
            .countdown
            .map(|c| c.has_expired(now))
            .unwrap_or(false);

        let transition = match self.phase {
            Phase::WaitingForParticipants => {
                if inputs.participants < self.roster.min_participants_to_start() {
                    return Ok(None);
                }
                let policy = self.create_policy(WARMUP_BEHAVIOR, now)?;
                self.spawn_policy = Some(policy);
                self.warmup_started_tick = Some(now);
                self.warmup_closed_tick = None;
                self.enter(
                    Phase::WarmupActive,
                    now,
                    Some(self.config.warmup.duration_secs),
                    vec![PhaseEffect::ResetSimulation, PhaseEffect::RebalanceTeams],
                )
            }
            Phase::WarmupActive => {
                if inputs.participants < self.roster.min_participants_to_start() {
                    self.spawn_policy = None;
                    self.warmup_started_tick = None;
                    self.enter(
                        Phase::WaitingForParticipants,
                        now,
                        None,
                        vec![PhaseEffect::ResetSimulation],
                    )
                } else if expired || inputs.early_start {
                    self.enter(
                        Phase::WarmupEnding,
                        now,
                        Some(self.config.warmup.ending_secs),
                        Vec::new(),
                    )
                } else {
                    return Ok(None);
                }
            }
            Phase::WarmupEnding => {
                if !expired {
                    return Ok(None);
                }
                let name = self.config.match_spawn_behavior.clone();
                let policy = self.create_policy(&name, now)?;
                self.spawn_policy = Some(policy);
                self.warmup_closed_tick = Some(now);
                self.enter(
                    Phase::WarmupEnded,
                    now,
                    Some(self.config.warmup.ended_delay_secs),
                    vec![
                        PhaseEffect::ResetSimulation,
                        PhaseEffect::RebalanceTeams,
                        PhaseEffect::FinalizeWarmupRewards,
                    ],
                )
            }
            Phase::WarmupEnded => {
                if !expired {
                    return Ok(None);
                }
                let time_limit = match self.config.mode {
                    GameMode::Skirmish => self.config.skirmish.as_ref().map(|s| s.time_limit_secs),
                    GameMode::Survival => None,
                };
                self.enter(
                    Phase::MatchActive,
                    now,
                    time_limit,
                    vec![PhaseEffect::BeginProgression],
                )
            }
            Phase::MatchActive => {
                let Some(outcome) = inputs.outcome else {
                    return Ok(None);
                };
                self.outcome = Some(outcome);
                self.spawn_policy = None;
                self.enter(
                    Phase::MatchEnding,
                    now,
                    Some(self.config.match_end_linger_secs),
                    vec![PhaseEffect::EndProgression(outcome)],
                )
            }
            Phase::MatchEnding => return Ok(None),
        };

        Ok(Some(transition))
    }

    fn create_policy(&self, name: &str, now: u64) -> Result<SpawnPolicy, MatchError> {
        let ctx = PolicyContext {
            config: &self.config,
            roster: self.roster.clone(),
            phase_start_tick: now,
        };
        self.behaviors.create(name, &ctx).ok_or_else(|| {
            error!(behavior = name, phase = ?self.phase, "Spawn behaviour is not registered");
            MatchError::MissingSpawnBehavior(name.to_string())
        })
    }

    fn enter(
        &mut self,
        to: Phase,
        now: u64,
        duration_secs: Option<f32>,
        effects: Vec<PhaseEffect>,
    ) -> PhaseTransition {
        let from = self.phase;
        self.phase = to;
        self.countdown = duration_secs.map(|d| Countdown::start(d, now));

        info!(from = ?from, to = ?to, tick = now, "Phase transition");

        PhaseTransition {
            from,
            to,
            start_tick: now,
            duration_secs: duration_secs.unwrap_or(0.0),
            effects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::{skirmish_config, survival_config};
    use crate::game::roster::ConfiguredRoster;
    use crate::game::Team;
    use crate::util::time::secs_to_ticks;

    fn machine_with(config: MatchConfig, behaviors: SpawnBehaviorRegistry) -> PhaseMachine {
        let config = Arc::new(config);
        let roster = Arc::new(ConfiguredRoster::new(config.clone()));
        PhaseMachine::new(config, roster, behaviors)
    }

    fn machine() -> PhaseMachine {
        machine_with(survival_config(), SpawnBehaviorRegistry::with_builtin())
    }

    fn inputs(now_tick: u64, participants: usize) -> PhaseInputs {
        PhaseInputs {
            now_tick,
            participants,
            ..Default::default()
        }
    }

    /// Tick until the next transition, returning it
    fn run_until_transition(m: &mut PhaseMachine, mut now: u64, participants: usize) -> (u64, PhaseTransition) {
        loop {
            now += 1;
            if let Some(t) = m.tick(inputs(now, participants)).unwrap() {
                return (now, t);
            }
            assert!(now < 1_000_000, "no transition");
        }
    }

    #[test]
    fn waits_for_minimum_participants() {
        let mut m = machine();
        assert_eq!(m.tick(inputs(1, 1)).unwrap(), None);
        assert_eq!(m.phase(), Phase::WaitingForParticipants);
        assert!(m.spawn_policy().is_none());

        let t = m.tick(inputs(2, 2)).unwrap().unwrap();
        assert_eq!(t.to, Phase::WarmupActive);
        assert_eq!(t.start_tick, 2);
        assert_eq!(t.duration_secs, 60.0);
        assert_eq!(t.effects, vec![PhaseEffect::ResetSimulation, PhaseEffect::RebalanceTeams]);
        assert_eq!(m.spawn_policy().unwrap().name(), "warmup");
    }

    #[test]
    fn full_path_passes_every_warmup_phase_in_order() {
        let mut m = machine();
        let mut now = 0;
        let mut seen = vec![m.phase()];
        while m.phase() != Phase::MatchActive {
            let (at, t) = run_until_transition(&mut m, now, 2);
            assert_eq!(t.from, *seen.last().unwrap());
            seen.push(t.to);
            now = at;
        }
        assert_eq!(
            seen,
            vec![
                Phase::WaitingForParticipants,
                Phase::WarmupActive,
                Phase::WarmupEnding,
                Phase::WarmupEnded,
                Phase::MatchActive,
            ]
        );
        assert_eq!(m.spawn_policy().unwrap().name(), "survival");
    }

    #[test]
    fn warmup_durations_follow_config() {
        let mut m = machine();
        m.tick(inputs(0, 2)).unwrap();
        let (at, ending) = run_until_transition(&mut m, 0, 2);
        assert_eq!(ending.to, Phase::WarmupEnding);
        assert_eq!(at, secs_to_ticks(60.0));
        assert_eq!(ending.duration_secs, 30.0);

        let (at2, ended) = run_until_transition(&mut m, at, 2);
        assert_eq!(ended.to, Phase::WarmupEnded);
        assert_eq!(at2 - at, secs_to_ticks(30.0));
        assert_eq!(
            ended.effects,
            vec![
                PhaseEffect::ResetSimulation,
                PhaseEffect::RebalanceTeams,
                PhaseEffect::FinalizeWarmupRewards,
            ]
        );
        assert_eq!(m.warmup_window(at2 + 100), Some((0, at2)));

        let (at3, active) = run_until_transition(&mut m, at2, 2);
        assert_eq!(active.to, Phase::MatchActive);
        assert_eq!(at3 - at2, secs_to_ticks(3.0));
        assert_eq!(active.effects, vec![PhaseEffect::BeginProgression]);
    }

    #[test]
    fn warmup_restarts_when_participants_drop() {
        let mut m = machine();
        m.tick(inputs(1, 2)).unwrap();
        let t = m.tick(inputs(2, 1)).unwrap().unwrap();
        assert_eq!(t.to, Phase::WaitingForParticipants);
        assert!(m.spawn_policy().is_none());
        assert_eq!(m.warmup_window(3), None);

        // Coming back restarts warmup from scratch
        let t = m.tick(inputs(10, 2)).unwrap().unwrap();
        assert_eq!(t.to, Phase::WarmupActive);
        assert_eq!(m.countdown().unwrap().start_tick, 10);
    }

    #[test]
    fn early_start_skips_remaining_warmup() {
        let mut m = machine();
        m.tick(inputs(1, 2)).unwrap();
        let t = m
            .tick(PhaseInputs {
                now_tick: 2,
                participants: 2,
                early_start: true,
                outcome: None,
            })
            .unwrap()
            .unwrap();
        assert_eq!(t.to, Phase::WarmupEnding);
    }

    #[test]
    fn early_start_never_skips_warmup_active() {
        let mut m = machine();
        let t = m
            .tick(PhaseInputs {
                now_tick: 1,
                participants: 2,
                early_start: true,
                outcome: None,
            })
            .unwrap()
            .unwrap();
        assert_eq!(t.to, Phase::WarmupActive);
    }

    #[test]
    fn missing_match_behaviour_is_fatal() {
        let mut config = survival_config();
        config.match_spawn_behavior = "king_of_the_hill".to_string();
        let mut m = machine_with(config, SpawnBehaviorRegistry::with_builtin());
        m.tick(inputs(0, 2)).unwrap();
        let (at, _) = run_until_transition(&mut m, 0, 2);

        let mut now = at;
        let err = loop {
            now += 1;
            match m.tick(inputs(now, 2)) {
                Ok(None) => continue,
                Ok(Some(t)) => panic!("unexpected transition {:?}", t),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, MatchError::MissingSpawnBehavior(name) if name == "king_of_the_hill"));
        assert_ne!(m.phase(), Phase::WarmupEnded);
    }

    #[test]
    fn outcome_ends_match_and_closes_spawns() {
        let mut m = machine_with(skirmish_config(), SpawnBehaviorRegistry::with_builtin());
        let mut now = 0;
        while m.phase() != Phase::MatchActive {
            now = run_until_transition(&mut m, now, 2).0;
        }
        assert_eq!(m.countdown().unwrap().duration_secs, 60.0);
        assert_eq!(m.tick(inputs(now + 1, 2)).unwrap(), None);

        let t = m
            .tick(PhaseInputs {
                now_tick: now + 2,
                participants: 2,
                early_start: false,
                outcome: Some(MatchOutcome::Won(Team::Defenders)),
            })
            .unwrap()
            .unwrap();
        assert_eq!(t.to, Phase::MatchEnding);
        assert_eq!(t.effects, vec![PhaseEffect::EndProgression(MatchOutcome::Won(Team::Defenders))]);
        assert!(m.spawn_policy().is_none());
        assert!(!m.is_finished(now + 3));
        assert!(m.is_finished(now + 2 + secs_to_ticks(10.0)));
    }
}
