//! Spawn eligibility - decides whether a respawn request is allowed right now

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{GameMode, MatchConfig};
use crate::game::roster::Roster;
use crate::game::Participant;
use crate::util::time::ticks_to_secs;

/// Width of the spawn window opened at the start of every respawn period (seconds)
pub const RESPAWN_WINDOW_SECS: f32 = 1.0;

/// Why a spawn request was turned down. Sent to the client verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SpawnRejection {
    /// No spawn policy is installed in the current phase
    PhaseClosed,
    /// Participant already controls a body
    AlreadyActive,
    /// Personal cooldown since the last spawn has not elapsed
    CooldownActive { retry_in_secs: f32 },
    /// Team respawn window is closed until the next period
    OutsideRespawnWindow { retry_in_secs: f32 },
    /// Equipped loadout carries no usable weapon
    InvalidLoadout,
    /// Joined while the current wave was running
    ExcludedFromWave,
}

impl SpawnRejection {
    pub fn code(&self) -> &'static str {
        match self {
            SpawnRejection::PhaseClosed => "phase_closed",
            SpawnRejection::AlreadyActive => "already_active",
            SpawnRejection::CooldownActive { .. } => "cooldown_active",
            SpawnRejection::OutsideRespawnWindow { .. } => "outside_respawn_window",
            SpawnRejection::InvalidLoadout => "invalid_loadout",
            SpawnRejection::ExcludedFromWave => "excluded_from_wave",
        }
    }

    /// Whether the host removes the participant instead of letting them retry
    pub fn removes_participant(&self) -> bool {
        matches!(self, SpawnRejection::InvalidLoadout)
    }
}

/// Clock a rule is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct SpawnClock {
    pub now_tick: u64,
    pub phase_start_tick: u64,
}

/// One composable eligibility check
pub trait SpawnRule: Send + Sync {
    fn check(&self, participant: &Participant, clock: SpawnClock) -> Result<(), SpawnRejection>;
}

pub struct BodyInactive;

impl SpawnRule for BodyInactive {
    fn check(&self, participant: &Participant, _clock: SpawnClock) -> Result<(), SpawnRejection> {
        if participant.has_active_body {
            Err(SpawnRejection::AlreadyActive)
        } else {
            Ok(())
        }
    }
}

/// Continuous cooldown measured from the participant's previous spawn
pub struct PersonalCooldown {
    pub cooldown_secs: f32,
}

impl SpawnRule for PersonalCooldown {
    fn check(&self, participant: &Participant, clock: SpawnClock) -> Result<(), SpawnRejection> {
        let Some(last) = participant.last_spawn_tick else {
            return Ok(());
        };
        let since = ticks_to_secs(clock.now_tick.saturating_sub(last));
        if since < self.cooldown_secs {
            return Err(SpawnRejection::CooldownActive {
                retry_in_secs: self.cooldown_secs - since,
            });
        }
        Ok(())
    }
}

/// Discrete per-team window: spawning is only open during the first second of each
/// respawn period counted from the phase start, so respawns come in bursts.
pub struct RespawnWindow {
    pub roster: Arc<dyn Roster>,
}

impl RespawnWindow {
    pub fn retry_in(period: f32, since_phase_start: f32) -> Option<f32> {
        if period <= 0.0 {
            return None;
        }
        let into_period = since_phase_start % period;
        if into_period > RESPAWN_WINDOW_SECS {
            Some(period - into_period)
        } else {
            None
        }
    }
}

impl SpawnRule for RespawnWindow {
    fn check(&self, participant: &Participant, clock: SpawnClock) -> Result<(), SpawnRejection> {
        let since = ticks_to_secs(clock.now_tick.saturating_sub(clock.phase_start_tick));
        match Self::retry_in(self.roster.respawn_period_secs(participant.team), since) {
            Some(retry_in_secs) => Err(SpawnRejection::OutsideRespawnWindow { retry_in_secs }),
            None => Ok(()),
        }
    }
}

pub struct LoadoutRequired;

impl SpawnRule for LoadoutRequired {
    fn check(&self, participant: &Participant, _clock: SpawnClock) -> Result<(), SpawnRejection> {
        if participant.loadout.has_usable_weapon() {
            Ok(())
        } else {
            Err(SpawnRejection::InvalidLoadout)
        }
    }
}

pub struct WaveExclusion;

impl SpawnRule for WaveExclusion {
    fn check(&self, participant: &Participant, _clock: SpawnClock) -> Result<(), SpawnRejection> {
        if participant.excluded_from_wave {
            Err(SpawnRejection::ExcludedFromWave)
        } else {
            Ok(())
        }
    }
}

/// The spawn behaviour installed by the phase machine
pub struct SpawnPolicy {
    name: String,
    phase_start_tick: u64,
    rules: Vec<Box<dyn SpawnRule>>,
    /// Initial spawns are placed at team locations rather than neutral ones
    pub team_locations: bool,
}

impl SpawnPolicy {
    pub fn new(name: impl Into<String>, phase_start_tick: u64, team_locations: bool) -> Self {
        Self {
            name: name.into(),
            phase_start_tick,
            rules: Vec::new(),
            team_locations,
        }
    }

    pub fn with_rule(mut self, rule: impl SpawnRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First failing rule, in installation order
    pub fn check(&self, participant: &Participant, now_tick: u64) -> Result<(), SpawnRejection> {
        let clock = SpawnClock {
            now_tick,
            phase_start_tick: self.phase_start_tick,
        };
        self.rules
            .iter()
            .try_for_each(|rule| rule.check(participant, clock))
    }

    #[cfg(test)]
    pub fn can_spawn(&self, participant: &Participant, now_tick: u64) -> bool {
        self.check(participant, now_tick).is_ok()
    }

    /// Permissive warmup behaviour: short personal cooldown, neutral locations
    pub fn warmup(ctx: &PolicyContext<'_>) -> Self {
        Self::new("warmup", ctx.phase_start_tick, false)
            .with_rule(BodyInactive)
            .with_rule(PersonalCooldown {
                cooldown_secs: ctx.config.warmup.spawn_cooldown_secs,
            })
    }

    pub fn skirmish(ctx: &PolicyContext<'_>) -> Self {
        Self::new("skirmish", ctx.phase_start_tick, true)
            .with_rule(BodyInactive)
            .with_rule(RespawnWindow {
                roster: ctx.roster.clone(),
            })
            .with_rule(LoadoutRequired)
    }

    pub fn survival(ctx: &PolicyContext<'_>) -> Self {
        Self::new("survival", ctx.phase_start_tick, true)
            .with_rule(BodyInactive)
            .with_rule(WaveExclusion)
            .with_rule(RespawnWindow {
                roster: ctx.roster.clone(),
            })
            .with_rule(LoadoutRequired)
    }
}

impl std::fmt::Debug for SpawnPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnPolicy")
            .field("name", &self.name)
            .field("phase_start_tick", &self.phase_start_tick)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Inputs a spawn behaviour factory builds its policy from
pub struct PolicyContext<'a> {
    pub config: &'a MatchConfig,
    pub roster: Arc<dyn Roster>,
    pub phase_start_tick: u64,
}

pub type SpawnBehaviorFactory = fn(&PolicyContext<'_>) -> SpawnPolicy;

/// Named spawn behaviours the phase machine can install
#[derive(Clone)]
pub struct SpawnBehaviorRegistry {
    factories: HashMap<String, SpawnBehaviorFactory>,
}

impl SpawnBehaviorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("warmup", SpawnPolicy::warmup);
        registry.register(GameMode::Skirmish.spawn_behavior(), SpawnPolicy::skirmish);
        registry.register(GameMode::Survival.spawn_behavior(), SpawnPolicy::survival);
        registry
    }

    pub fn register(&mut self, name: &str, factory: SpawnBehaviorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str, ctx: &PolicyContext<'_>) -> Option<SpawnPolicy> {
        self.factories.get(name).map(|factory| factory(ctx))
    }
}

impl Default for SpawnBehaviorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::survival_config;
    use crate::game::roster::ConfiguredRoster;
    use crate::game::{Loadout, Team};
    use crate::util::time::SIMULATION_TPS;
    use uuid::Uuid;

    const TPS: u64 = SIMULATION_TPS as u64;

    fn policy(build: SpawnBehaviorFactory, phase_start_tick: u64) -> SpawnPolicy {
        let config = Arc::new(survival_config());
        let ctx = PolicyContext {
            config: &config,
            roster: Arc::new(ConfiguredRoster::new(config.clone())),
            phase_start_tick,
        };
        build(&ctx)
    }

    fn participant() -> Participant {
        let mut p = Participant::new(Uuid::new_v4(), "tester".to_string(), Team::Defenders, 0);
        p.loadout = Loadout::basic();
        p
    }

    #[test]
    fn respawn_window_opens_once_per_period() {
        assert_eq!(RespawnWindow::retry_in(10.0, 0.0), None);
        assert_eq!(RespawnWindow::retry_in(10.0, 1.0), None);
        assert_eq!(RespawnWindow::retry_in(10.0, 4.0), Some(6.0));
        assert_eq!(RespawnWindow::retry_in(10.0, 10.5), None);
        assert_eq!(RespawnWindow::retry_in(0.0, 4.0), None);
    }

    #[test]
    fn match_policy_rejects_outside_window_with_reason() {
        let policy = policy(SpawnPolicy::survival, 0);
        let p = participant();

        assert!(policy.can_spawn(&p, 0));
        let rejection = policy.check(&p, 5 * TPS).unwrap_err();
        assert_eq!(rejection.code(), "outside_respawn_window");
        // respawn period for defenders is 10s in the test config
        assert!(policy.can_spawn(&p, 10 * TPS));
    }

    #[test]
    fn invalid_loadout_is_rejected_and_removes() {
        let policy = policy(SpawnPolicy::survival, 0);
        let mut p = participant();
        p.loadout = Loadout::default();
        let rejection = policy.check(&p, 0).unwrap_err();
        assert_eq!(rejection, SpawnRejection::InvalidLoadout);
        assert!(rejection.removes_participant());
    }

    #[test]
    fn warmup_policy_ignores_loadout_and_uses_cooldown() {
        let policy = policy(SpawnPolicy::warmup, 0);
        let mut p = participant();
        p.loadout = Loadout::default();
        assert!(policy.can_spawn(&p, 0));

        p.last_spawn_tick = Some(100);
        match policy.check(&p, 100 + TPS) {
            Err(SpawnRejection::CooldownActive { retry_in_secs }) => {
                assert!((retry_in_secs - 2.0).abs() < 1e-4)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(policy.can_spawn(&p, 100 + 3 * TPS));
    }

    #[test]
    fn active_body_and_wave_exclusion_block_spawns() {
        let policy = policy(SpawnPolicy::survival, 0);
        let mut p = participant();
        p.has_active_body = true;
        assert_eq!(policy.check(&p, 0), Err(SpawnRejection::AlreadyActive));
        p.has_active_body = false;
        p.excluded_from_wave = true;
        assert_eq!(policy.check(&p, 0), Err(SpawnRejection::ExcludedFromWave));
    }

    #[test]
    fn registry_resolves_builtin_behaviours_only() {
        let config = Arc::new(survival_config());
        let ctx = PolicyContext {
            config: &config,
            roster: Arc::new(ConfiguredRoster::new(config.clone())),
            phase_start_tick: 3,
        };
        let registry = SpawnBehaviorRegistry::with_builtin();
        let survival = registry.create("survival", &ctx).unwrap();
        assert_eq!(survival.name(), "survival");
        assert_eq!(survival.phase_start_tick, 3);
        assert!(registry.create("capture_the_flag", &ctx).is_none());
    }
}
