//! Static match configuration, loaded once per session and shared read-only

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::game::spawn::SpawnCandidate;
use crate::game::Team;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Defenders hold out against server-spawned waves
    Survival,
    /// Two human teams, ended by the time limit
    Skirmish,
}

impl GameMode {
    /// Name of the built-in spawn behaviour for this mode
    pub fn spawn_behavior(&self) -> &'static str {
        match self {
            GameMode::Survival => "survival",
            GameMode::Skirmish => "skirmish",
        }
    }
}

/// A value per team
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamValues<T> {
    pub attackers: T,
    pub defenders: T,
}

impl<T> TeamValues<T> {
    pub fn get(&self, team: Team) -> &T {
        match team {
            Team::Attackers => &self.attackers,
            Team::Defenders => &self.defenders,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Length of the open warmup (seconds)
    #[serde(default = "default_warmup_duration")]
    pub duration_secs: f32,
    /// Countdown announced once warmup is over
    #[serde(default = "default_warmup_ending")]
    pub ending_secs: f32,
    /// Pause after the reset so clients finish the transition
    #[serde(default = "default_warmup_ended_delay")]
    pub ended_delay_secs: f32,
    #[serde(default = "default_warmup_spawn_cooldown")]
    pub spawn_cooldown_secs: f32,
    #[serde(default)]
    pub reward_per_minute: f64,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_warmup_duration(),
            ending_secs: default_warmup_ending(),
            ended_delay_secs: default_warmup_ended_delay(),
            spawn_cooldown_secs: default_warmup_spawn_cooldown(),
            reward_per_minute: 0.0,
        }
    }
}

/// One wave of opposing units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveSpec {
    /// (unit kind, count) pairs
    pub composition: Vec<(String, u32)>,
    #[serde(default = "default_reward_weight")]
    pub reward_weight: f64,
}

impl WaveSpec {
    pub fn unit_count(&self) -> u32 {
        self.composition.iter().map(|(_, count)| count).sum()
    }
}

/// An ordered sequence of waves plus the reward for clearing all of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSpec {
    pub base_reward: f64,
    pub waves: Vec<WaveSpec>,
}

impl RoundSpec {
    pub fn total_weight(&self) -> f64 {
        self.waves.iter().map(|w| w.reward_weight).sum()
    }

    /// Weighted share of the round reward earned by winning the first `waves_won` waves
    pub fn won_fraction(&self, waves_won: usize) -> f64 {
        let total = self.total_weight();
        if total <= 0.0 {
            return 0.0;
        }
        let won: f64 = self
            .waves
            .iter()
            .take(waves_won)
            .map(|w| w.reward_weight)
            .sum();
        won / total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalConfig {
    /// Delay between a round starting and its first wave
    #[serde(default = "default_round_start_delay")]
    pub round_start_delay_secs: f32,
    /// Countdown between waves of the same round
    #[serde(default = "default_wave_countdown")]
    pub wave_countdown_secs: f32,
    /// Defenders are beaten once their living count drops to this value
    #[serde(default)]
    pub defender_loss_threshold: usize,
    pub rounds: Vec<RoundSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkirmishConfig {
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: f32,
    #[serde(default)]
    pub reward_per_minute: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub name: String,
    pub spawn_candidates: Vec<SpawnCandidate>,
}

/// Complete match configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    pub mode: GameMode,
    #[serde(default = "default_min_participants")]
    pub min_participants_to_start: usize,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default)]
    pub warmup: WarmupConfig,
    /// Spawn behaviour installed when warmup ends
    pub match_spawn_behavior: String,
    pub respawn_period_secs: TeamValues<f32>,
    /// How long the session lingers after the match is decided
    #[serde(default = "default_end_linger")]
    pub match_end_linger_secs: f32,
    #[serde(default)]
    pub survival: Option<SurvivalConfig>,
    #[serde(default)]
    pub skirmish: Option<SkirmishConfig>,
    pub map: MapConfig,
}

impl MatchConfig {
    /// Read and validate a JSON match configuration
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadMatchConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: MatchConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_participants_to_start == 0
            || self.max_participants < self.min_participants_to_start
        {
            return Err(ConfigError::InvalidParticipantLimits {
                min: self.min_participants_to_start,
                max: self.max_participants,
            });
        }

        if self.map.spawn_candidates.is_empty() {
            return Err(ConfigError::NoSpawnCandidates(self.map.name.clone()));
        }

        match self.mode {
            GameMode::Survival => {
                let survival = self
                    .survival
                    .as_ref()
                    .ok_or(ConfigError::MissingModeSection(self.mode, "survival"))?;
                validate_rounds(&survival.rounds)?;
            }
            GameMode::Skirmish => {
                if self.skirmish.is_none() {
                    return Err(ConfigError::MissingModeSection(self.mode, "skirmish"));
                }
            }
        }

        Ok(())
    }
}

fn validate_rounds(rounds: &[RoundSpec]) -> Result<(), ConfigError> {
    if rounds.is_empty() {
        return Err(ConfigError::NoRounds);
    }
    for (round, spec) in rounds.iter().enumerate() {
        if spec.waves.is_empty() {
            return Err(ConfigError::EmptyRound { round });
        }
        if !(spec.base_reward > 0.0) {
            return Err(ConfigError::InvalidBaseReward { round });
        }
        for (wave, wave_spec) in spec.waves.iter().enumerate() {
            if wave_spec.unit_count() == 0 {
                return Err(ConfigError::EmptyWave { round, wave });
            }
            if !(wave_spec.reward_weight > 0.0) {
                return Err(ConfigError::InvalidWaveWeight { round, wave });
            }
        }
    }
    Ok(())
}

fn default_warmup_duration() -> f32 {
    120.0
}

fn default_warmup_ending() -> f32 {
    30.0
}

fn default_warmup_ended_delay() -> f32 {
    3.0
}

fn default_warmup_spawn_cooldown() -> f32 {
    3.0
}

fn default_reward_weight() -> f64 {
    1.0
}

fn default_round_start_delay() -> f32 {
    10.0
}

fn default_wave_countdown() -> f32 {
    15.0
}

fn default_time_limit() -> f32 {
    900.0
}

fn default_min_participants() -> usize {
    2
}

fn default_max_participants() -> usize {
    32
}

fn default_end_linger() -> f32 {
    10.0
}
