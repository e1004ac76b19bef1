//! Match session and authoritative tick loop
//!
//! One task per session. Every tick drains queued inputs, advances the active
//! progression logic, ticks the phase machine, applies the resulting effects and then
//! answers spawn requests, so announcements always precede the spawns they enable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, GameMode, MatchConfig};
use crate::util::time::{ticks_to_secs, SIMULATION_TPS, SNAPSHOT_TPS, TICK_DURATION_MICROS};
use crate::ws::protocol::{ClientMsg, MatchEvent, ServerMsg, UnitInfo};

use super::events::{EventBus, Listener, SubscriptionId};
use super::phase::{Phase, PhaseEffect, PhaseInputs, PhaseMachine, PhaseTransition};
use super::rewards::{ApplyOutcome, RewardGateway, RewardKey};
use super::roster::{self, ConfiguredRoster};
use super::skirmish::{MatchEndPredicate, TimeLimit};
use super::snapshot::SnapshotBuilder;
use super::spawn::{
    ActiveBody, PlacementError, PlacementRequest, PlacementSystem, SpawnBehaviorRegistry, SpawnRejection,
};
use super::survival::{SurvivalController, SurvivalEvent, SurvivalObservation};
use super::{Loadout, MatchOutcome, OpposingUnit, Participant, ParticipantId, SessionInput, Team};

/// Errors that stop a session. The host broadcasts `session_terminated` and exits.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("Spawn behaviour `{0}` is not registered")]
    MissingSpawnBehavior(String),

    #[error("Invalid match config: {0}")]
    Config(#[from] ConfigError),

    #[error("Spawn placement failed: {0}")]
    Placement(#[from] PlacementError),
}

/// Match state (owned by match task)
pub struct MatchState {
    pub id: Uuid,
    pub seed: u64,
    pub tick: u64,
    pub participants: HashMap<ParticipantId, Participant>,
    pub units: HashMap<Uuid, OpposingUnit>,
    pub units_spawned_this_wave: u32,
    pub critical_unit_alive: bool,
    /// Spawn requests waiting for the end of the tick, in arrival order
    pub pending_spawns: Vec<ParticipantId>,
    pub force_start: bool,
    pub match_active_tick: Option<u64>,
    pub rng: ChaCha8Rng,
}

impl MatchState {
    pub fn new(id: Uuid, seed: u64) -> Self {
        Self {
            id,
            seed,
            tick: 0,
            participants: HashMap::new(),
            units: HashMap::new(),
            units_spawned_this_wave: 0,
            critical_unit_alive: true,
            pending_spawns: Vec::new(),
            force_start: false,
            match_active_tick: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Participant ids in join order, optionally restricted to one team
    fn ids_in_join_order(&self, team: Option<Team>) -> Vec<ParticipantId> {
        let mut ids: Vec<(u64, ParticipantId)> = self
            .participants
            .values()
            .filter(|p| team.map_or(true, |t| p.team == t))
            .map(|p| (p.joined_tick, p.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Everything currently occupying the map, optionally excluding one participant
    fn active_bodies(&self, except: Option<ParticipantId>) -> Vec<ActiveBody> {
        let mut bodies = Vec::new();
        for participant in self.participants.values() {
            if !participant.has_active_body || Some(participant.id) == except {
                continue;
            }
            bodies.push(ActiveBody {
                position: participant.position,
                is_mount: false,
            });
            if participant.loadout.has_mount {
                bodies.push(ActiveBody {
                    position: participant.position,
                    is_mount: true,
                });
            }
        }
        bodies.extend(self.units.values().filter(|u| u.alive).map(|u| ActiveBody {
            position: u.position,
            is_mount: false,
        }));
        bodies
    }

    fn units_alive(&self) -> u32 {
        self.units.values().filter(|u| u.alive).count() as u32
    }

    fn early_start(&self) -> bool {
        self.force_start
            || (!self.participants.is_empty() && self.participants.values().all(|p| p.ready))
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<SessionInput>,
    pub events_tx: broadcast::Sender<ServerMsg>,
    pub participant_count: Arc<AtomicUsize>,
    pub tick: Arc<AtomicU64>,
    /// Latest `phase_changed` event, replayed to late joiners
    pub latest_phase: Arc<RwLock<Option<ServerMsg>>>,
    pub rewards: Arc<RewardGateway>,
}

impl MatchHandle {
    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn latest_phase(&self) -> Option<ServerMsg> {
        self.latest_phase.read().clone()
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_participants(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().participant_count())
            .sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Progression logic that runs while the match is live
enum Progression {
    Survival(SurvivalController),
    Custom(Box<dyn MatchEndPredicate>),
}

/// The authoritative match session
pub struct GameMatch {
    state: MatchState,
    config: Arc<MatchConfig>,
    phase: PhaseMachine,
    progression: Progression,
    rewards: Arc<RewardGateway>,
    bus: EventBus,
    /// Listeners this session attached, detached explicitly on teardown
    subscriptions: Vec<SubscriptionId>,
    input_rx: mpsc::Receiver<SessionInput>,
    snapshot_builder: SnapshotBuilder,
    participant_count: Arc<AtomicUsize>,
    tick: Arc<AtomicU64>,
}

impl GameMatch {
    /// Create a new match with the built-in spawn behaviours
    pub fn new(
        id: Uuid,
        seed: u64,
        config: Arc<MatchConfig>,
        rewards: Arc<RewardGateway>,
    ) -> Result<(Self, MatchHandle), MatchError> {
        Self::with_behaviors(id, seed, config, rewards, SpawnBehaviorRegistry::with_builtin())
    }

    pub fn with_behaviors(
        id: Uuid,
        seed: u64,
        config: Arc<MatchConfig>,
        rewards: Arc<RewardGateway>,
        behaviors: SpawnBehaviorRegistry,
    ) -> Result<(Self, MatchHandle), MatchError> {
        config.validate()?;

        let progression = match config.mode {
            GameMode::Survival => {
                let survival = config
                    .survival
                    .as_ref()
                    .ok_or(ConfigError::MissingModeSection(GameMode::Survival, "survival"))?;
                Progression::Survival(SurvivalController::new(survival))
            }
            GameMode::Skirmish => {
                let skirmish = config
                    .skirmish
                    .as_ref()
                    .ok_or(ConfigError::MissingModeSection(GameMode::Skirmish, "skirmish"))?;
                Progression::Custom(Box::new(TimeLimit::new(skirmish.time_limit_secs)))
            }
        };

        let (input_tx, input_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(256);
        let participant_count = Arc::new(AtomicUsize::new(0));
        let tick = Arc::new(AtomicU64::new(0));
        let latest_phase = Arc::new(RwLock::new(None));

        let handle = MatchHandle {
            id,
            input_tx,
            events_tx: events_tx.clone(),
            participant_count: participant_count.clone(),
            tick: tick.clone(),
            latest_phase: latest_phase.clone(),
            rewards: rewards.clone(),
        };

        let roster = Arc::new(ConfiguredRoster::new(config.clone()));
        let mut bus = EventBus::new(events_tx, latest_phase);
        let trace_listener = bus.subscribe(Box::new(move |tick, event| {
            debug!(match_id = %id, tick, event = ?event, "Match event");
        }));

        let snapshot_interval = SIMULATION_TPS / SNAPSHOT_TPS;
        let game_match = Self {
            state: MatchState::new(id, seed),
            phase: PhaseMachine::new(config.clone(), roster, behaviors),
            config,
            progression,
            rewards,
            bus,
            subscriptions: vec![trace_listener],
            input_rx,
            snapshot_builder: SnapshotBuilder::new(snapshot_interval),
            participant_count,
            tick,
        };

        Ok((game_match, handle))
    }

    /// Attach an in-process listener for the lifetime of the session
    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = self.bus.subscribe(listener);
        self.subscriptions.push(id);
        id
    }

    fn detach_listeners(&mut self) {
        for id in std::mem::take(&mut self.subscriptions) {
            self.bus.unsubscribe(id);
        }
        debug!(
            match_id = %self.state.id,
            remaining = self.bus.listener_count(),
            "Match listeners detached"
        );
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase.phase()
    }

    #[cfg(test)]
    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self) {
        info!(
            match_id = %self.state.id,
            mode = ?self.config.mode,
            map = %self.config.map.name,
            seed = self.state.seed,
            "Match session opened"
        );

        let mut tick_interval = interval(Duration::from_micros(TICK_DURATION_MICROS));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            if let Err(e) = self.step() {
                error!(match_id = %self.state.id, error = %e, "Match session terminated");
                self.bus.send(ServerMsg::SessionTerminated {
                    reason: e.to_string(),
                });
                break;
            }

            if self.phase.is_finished(self.state.tick) {
                info!(match_id = %self.state.id, outcome = ?self.phase.outcome(), "Match ended");
                self.bus.send(ServerMsg::SessionClosed {
                    outcome: self.phase.outcome(),
                });
                break;
            }

            // Check if everybody left a live match
            if self.state.participants.is_empty()
                && matches!(self.phase.phase(), Phase::MatchActive | Phase::MatchEnding)
            {
                info!(match_id = %self.state.id, "All participants left, closing session");
                self.bus.send(ServerMsg::SessionClosed {
                    outcome: self.phase.outcome(),
                });
                break;
            }
        }

        info!(
            match_id = %self.state.id,
            rewards_recorded = self.rewards.len(),
            "Match session closed"
        );
        self.detach_listeners();
    }

    /// Advance the session by one tick. Errors are fatal for the session.
    pub fn step(&mut self) -> Result<(), MatchError> {
        self.state.tick += 1;
        self.tick.store(self.state.tick, Ordering::Relaxed);
        self.process_inputs();
        self.advance()
    }

    fn advance(&mut self) -> Result<(), MatchError> {
        let now = self.state.tick;

        let outcome = if self.phase.phase() == Phase::MatchActive {
            self.advance_progression()?
        } else {
            None
        };

        let inputs = PhaseInputs {
            now_tick: now,
            participants: self.state.participants.len(),
            early_start: self.state.early_start(),
            outcome,
        };
        if let Some(transition) = self.phase.tick(inputs)? {
            self.bus.publish(
                now,
                MatchEvent::PhaseChanged {
                    phase: transition.to,
                    start_tick: transition.start_tick,
                    duration_secs: transition.duration_secs,
                },
            );
            self.apply_effects(&transition)?;
            if transition.to == Phase::WaitingForParticipants {
                debug!(match_id = %self.state.id, from = ?transition.from, "Warmup abandoned, clearing ready votes");
                // Ready votes only count toward the warmup they were cast in
                self.state.force_start = false;
                for participant in self.state.participants.values_mut() {
                    participant.ready = false;
                }
            }
            self.snapshot_builder.force_next();
        }

        self.process_spawn_requests()?;

        if self.snapshot_builder.should_send() {
            let round = match &self.progression {
                Progression::Survival(controller) => Some(controller.state()),
                Progression::Custom(_) => None,
            };
            let snapshot = self.snapshot_builder.build(
                now,
                self.phase.phase(),
                self.phase.countdown(),
                round,
                &self.state.participants,
                self.state.units_alive(),
            );
            self.bus.send(snapshot);
        }
        Ok(())
    }

    /// Process all pending inputs from connections
    fn process_inputs(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            self.handle_input(input);
        }
    }

    /// Apply one input immediately
    pub fn handle_input(&mut self, input: SessionInput) {
        let id = input.participant_id;
        match input.msg {
            ClientMsg::Join { loadout } => self.handle_join(id, input.display_name, loadout),
            ClientMsg::RequestSpawn => {
                if !self.state.participants.contains_key(&id) {
                    return;
                }
                if !self.state.pending_spawns.contains(&id) {
                    self.state.pending_spawns.push(id);
                }
            }
            ClientMsg::UpdateLoadout { loadout } => {
                if let Some(participant) = self.state.participants.get_mut(&id) {
                    participant.loadout = loadout;
                }
            }
            ClientMsg::Position { x, y } => {
                if let Some(participant) = self.state.participants.get_mut(&id) {
                    if participant.has_active_body {
                        participant.position.x = x;
                        participant.position.y = y;
                    }
                }
            }
            ClientMsg::Ready => {
                if let Some(participant) = self.state.participants.get_mut(&id) {
                    participant.ready = true;
                }
            }
            ClientMsg::Ping { t } => self.bus.send(ServerMsg::Pong { participant_id: id, t }),
            ClientMsg::Leave => self.handle_leave(id, "left"),
            ClientMsg::UnitEliminated { unit_id } => {
                if let Some(unit) = self.state.units.get_mut(&unit_id) {
                    unit.alive = false;
                    debug!(match_id = %self.state.id, unit_id = %unit_id, kind = %unit.kind, "Unit eliminated");
                }
            }
            ClientMsg::ParticipantDown { participant_id } => {
                if let Some(participant) = self.state.participants.get_mut(&participant_id) {
                    participant.has_active_body = false;
                }
            }
            ClientMsg::CriticalUnitDestroyed => {
                warn!(match_id = %self.state.id, "Critical unit destroyed");
                self.state.critical_unit_alive = false;
            }
            ClientMsg::ForceStart => {
                info!(match_id = %self.state.id, "Early start forced");
                self.state.force_start = true;
            }
        }
    }

    fn handle_join(&mut self, id: ParticipantId, display_name: String, loadout: Loadout) {
        if self.state.participants.contains_key(&id) {
            warn!(participant_id = %id, "Participant already in match");
            return;
        }

        if self.state.participants.len() >= self.config.max_participants {
            warn!(match_id = %self.state.id, participant_id = %id, "Join rejected, match is full");
            self.bus.send(ServerMsg::Error {
                participant_id: id,
                code: "match_full".to_string(),
                message: "Match is full".to_string(),
            });
            return;
        }

        let existing: Vec<&Participant> = self.state.participants.values().collect();
        let team = roster::assign_team(self.config.mode, &existing);
        let mut participant = Participant::new(id, display_name.clone(), team, self.state.tick);
        participant.loadout = loadout;
        if let Progression::Survival(controller) = &self.progression {
            participant.excluded_from_wave = controller.is_wave_active();
        }

        self.state.participants.insert(id, participant);
        self.participant_count
            .store(self.state.participants.len(), Ordering::Relaxed);

        self.bus.publish(
            self.state.tick,
            MatchEvent::ParticipantJoined {
                participant_id: id,
                display_name,
                team,
            },
        );

        info!(
            match_id = %self.state.id,
            participant_id = %id,
            team = ?team,
            participant_count = self.state.participants.len(),
            "Participant joined match"
        );
    }

    /// Remove a participant and settle whatever they already earned
    fn handle_leave(&mut self, id: ParticipantId, reason: &str) {
        let Some(participant) = self.state.participants.get(&id) else {
            return;
        };

        if self.phase.phase().is_warmup() {
            let amount = self.warmup_reward(participant);
            if amount > 0.0 {
                self.rewards.stage(id, &RewardKey::warmup(), amount);
            }
        }
        if self.phase.phase() == Phase::MatchActive {
            if let Some(amount) = self.match_reward(participant) {
                self.rewards.stage(id, &RewardKey::match_end(), amount);
            }
        }

        for (key, amount, outcome) in self.rewards.on_participant_left(id) {
            if outcome == ApplyOutcome::Applied {
                self.bus.publish(
                    self.state.tick,
                    MatchEvent::RewardApplied {
                        participant_id: id,
                        key,
                        amount,
                    },
                );
            }
        }

        self.state.participants.remove(&id);
        self.state.pending_spawns.retain(|p| *p != id);
        self.participant_count
            .store(self.state.participants.len(), Ordering::Relaxed);

        self.bus.publish(
            self.state.tick,
            MatchEvent::ParticipantLeft {
                participant_id: id,
                reason: reason.to_string(),
            },
        );

        info!(
            match_id = %self.state.id,
            participant_id = %id,
            reason,
            "Participant left match"
        );
    }

    /// Warmup reward for time present between warmup start and close (or now)
    fn warmup_reward(&self, participant: &Participant) -> f64 {
        let Some((start, end)) = self.phase.warmup_window(self.state.tick) else {
            return 0.0;
        };
        let from = participant.joined_tick.max(start);
        if end <= from {
            return 0.0;
        }
        let minutes = ticks_to_secs(end - from) as f64 / 60.0;
        self.config.warmup.reward_per_minute * minutes
    }

    /// Time-based match reward for modes without a round structure
    fn match_reward(&self, participant: &Participant) -> Option<f64> {
        let rate = self.config.skirmish.as_ref()?.reward_per_minute;
        let start = self.state.match_active_tick?;
        let from = participant.joined_tick.max(start);
        let minutes = ticks_to_secs(self.state.tick.saturating_sub(from)) as f64 / 60.0;
        Some(rate * minutes)
    }

    fn apply_reward(&mut self, id: ParticipantId, key: &RewardKey, amount: f64) {
        if self.rewards.apply(id, key, amount) == ApplyOutcome::Applied {
            self.bus.publish(
                self.state.tick,
                MatchEvent::RewardApplied {
                    participant_id: id,
                    key: key.clone(),
                    amount,
                },
            );
        }
    }

    fn advance_progression(&mut self) -> Result<Option<MatchOutcome>, MatchError> {
        let now = self.state.tick;
        match &mut self.progression {
            Progression::Survival(controller) => {
                let defenders = self.state.ids_in_join_order(Some(Team::Defenders));
                let defenders_alive = defenders
                    .iter()
                    .filter(|id| {
                        self.state
                            .participants
                            .get(*id)
                            .map_or(false, |p| p.has_active_body)
                    })
                    .count();
                let obs = SurvivalObservation {
                    now_tick: now,
                    defenders: &defenders,
                    defenders_alive,
                    attackers_spawned: self.state.units_spawned_this_wave,
                    attackers_alive: self.state.units_alive(),
                    critical_unit_alive: self.state.critical_unit_alive,
                };
                let events = controller.tick(&obs, &self.rewards);
                let outcome = controller.outcome();
                self.apply_survival_events(events)?;
                Ok(outcome)
            }
            Progression::Custom(predicate) => {
                Ok(predicate.check(now, &mut self.state.participants.values()))
            }
        }
    }

    fn apply_effects(&mut self, transition: &PhaseTransition) -> Result<(), MatchError> {
        for effect in &transition.effects {
            match *effect {
                PhaseEffect::ResetSimulation => self.reset_simulation(),
                PhaseEffect::RebalanceTeams => self.rebalance_teams(),
                PhaseEffect::FinalizeWarmupRewards => self.finalize_warmup_rewards(),
                PhaseEffect::BeginProgression => self.begin_progression()?,
                PhaseEffect::EndProgression(outcome) => self.end_progression(outcome),
            }
        }
        Ok(())
    }

    fn reset_simulation(&mut self) {
        for participant in self.state.participants.values_mut() {
            participant.reset_body();
            participant.excluded_from_wave = false;
        }
        self.state.units.clear();
        self.state.units_spawned_this_wave = 0;
        self.state.critical_unit_alive = true;
        debug!(match_id = %self.state.id, "Simulation reset");
    }

    fn rebalance_teams(&mut self) {
        let before: Vec<(ParticipantId, Team)> = self
            .state
            .participants
            .values()
            .map(|p| (p.id, p.team))
            .collect();

        let mut participants: Vec<&mut Participant> = self.state.participants.values_mut().collect();
        roster::rebalance(self.config.mode, &mut participants);

        let mut changed: Vec<(ParticipantId, Team)> = before
            .into_iter()
            .filter_map(|(id, old)| {
                let team = self.state.participants.get(&id)?.team;
                (team != old).then_some((id, team))
            })
            .collect();
        changed.sort_by_key(|(id, _)| *id);
        for (participant_id, team) in changed {
            self.bus.publish(
                self.state.tick,
                MatchEvent::TeamAssigned {
                    participant_id,
                    team,
                },
            );
        }
    }

    fn finalize_warmup_rewards(&mut self) {
        let key = RewardKey::warmup();
        let owed: Vec<(ParticipantId, f64)> = self
            .state
            .ids_in_join_order(None)
            .into_iter()
            .filter_map(|id| {
                let participant = self.state.participants.get(&id)?;
                Some((id, self.warmup_reward(participant)))
            })
            .filter(|(_, amount)| *amount > 0.0)
            .collect();
        for (id, amount) in owed {
            self.apply_reward(id, &key, amount);
        }
    }

    fn begin_progression(&mut self) -> Result<(), MatchError> {
        let now = self.state.tick;
        self.state.match_active_tick = Some(now);
        let events = match &mut self.progression {
            Progression::Survival(controller) => {
                let eligible = self
                    .state
                    .participants
                    .values()
                    .filter(|p| p.team == Team::Defenders)
                    .count();
                controller.begin(now, eligible)
            }
            Progression::Custom(predicate) => {
                predicate.begin(now);
                Vec::new()
            }
        };
        self.apply_survival_events(events)
    }

    fn end_progression(&mut self, outcome: MatchOutcome) {
        self.bus.publish(self.state.tick, MatchEvent::MatchEnded { outcome });

        if matches!(self.progression, Progression::Custom(_)) {
            let key = RewardKey::match_end();
            let owed: Vec<(ParticipantId, f64)> = self
                .state
                .ids_in_join_order(None)
                .into_iter()
                .filter_map(|id| {
                    let participant = self.state.participants.get(&id)?;
                    Some((id, self.match_reward(participant)?))
                })
                .collect();
            for (id, amount) in owed {
                self.apply_reward(id, &key, amount);
            }
        }

        info!(match_id = %self.state.id, outcome = ?outcome, "Match decided");
    }

    fn apply_survival_events(&mut self, events: Vec<SurvivalEvent>) -> Result<(), MatchError> {
        let now = self.state.tick;
        for event in events {
            match event {
                SurvivalEvent::RoundStarted {
                    round_index,
                    start_tick,
                } => self.bus.publish(
                    now,
                    MatchEvent::RoundStarted {
                        round_index,
                        start_tick,
                    },
                ),
                SurvivalEvent::WaveCountdownStarted {
                    round_index,
                    next_wave_index,
                    countdown,
                } => self.bus.publish(
                    now,
                    MatchEvent::WaveCountdown {
                        round_index,
                        next_wave_index,
                        start_tick: countdown.start_tick,
                        duration_secs: countdown.duration_secs,
                    },
                ),
                SurvivalEvent::WaveStarted {
                    round_index,
                    wave_index,
                    start_tick,
                    composition,
                } => {
                    let unit_count = composition.iter().map(|(_, count)| count).sum();
                    self.bus.publish(
                        now,
                        MatchEvent::WaveStarted {
                            round_index,
                            wave_index,
                            start_tick,
                            unit_count,
                        },
                    );
                    self.start_wave(wave_index, &composition)?;
                }
                SurvivalEvent::WaveCleared {
                    round_index,
                    wave_index,
                } => self.bus.publish(
                    now,
                    MatchEvent::WaveCleared {
                        round_index,
                        wave_index,
                    },
                ),
                SurvivalEvent::RoundRewarded {
                    round_index,
                    waves_won,
                    amount,
                    recipients,
                } => self.bus.publish(
                    now,
                    MatchEvent::RoundRewarded {
                        round_index,
                        waves_won,
                        amount,
                        recipients,
                    },
                ),
                // The phase machine announces the end
                SurvivalEvent::MatchDecided(_) => {}
            }
        }
        Ok(())
    }

    /// Restore defenders, bring back anyone without a body and spawn the wave
    fn start_wave(&mut self, wave_index: i32, composition: &[(String, u32)]) -> Result<(), MatchError> {
        let defenders = self.state.ids_in_join_order(Some(Team::Defenders));
        for id in &defenders {
            if let Some(participant) = self.state.participants.get_mut(id) {
                participant.restore();
                participant.excluded_from_wave = false;
            }
        }
        for id in defenders {
            let ready = self
                .state
                .participants
                .get(&id)
                .map_or(false, |p| !p.has_active_body && p.loadout.has_usable_weapon());
            if ready {
                self.spawn_participant(id, true)?;
            }
        }

        self.state.units.clear();
        let mut spawned = Vec::new();
        for (kind, count) in composition {
            for _ in 0..*count {
                let bodies = self.state.active_bodies(None);
                let request = PlacementRequest {
                    team: Team::Attackers,
                    has_mount: false,
                    is_initial_spawn: true,
                };
                let candidate = PlacementSystem::select(
                    &self.config.map.spawn_candidates,
                    &request,
                    &bodies,
                    &mut self.state.rng,
                )?;
                let unit = OpposingUnit {
                    id: Uuid::new_v4(),
                    kind: kind.clone(),
                    position: candidate.position,
                    alive: true,
                };
                spawned.push(UnitInfo {
                    unit_id: unit.id,
                    kind: kind.clone(),
                    location_id: candidate.location_id.clone(),
                });
                self.state.units.insert(unit.id, unit);
            }
        }
        self.state.units_spawned_this_wave = spawned.len() as u32;

        self.bus.publish(
            self.state.tick,
            MatchEvent::UnitsSpawned {
                wave_index,
                units: spawned,
            },
        );
        Ok(())
    }

    /// Answer queued spawn requests against the installed spawn policy
    fn process_spawn_requests(&mut self) -> Result<(), MatchError> {
        let now = self.state.tick;
        let requests = std::mem::take(&mut self.state.pending_spawns);

        for id in requests {
            let Some(participant) = self.state.participants.get(&id) else {
                continue;
            };
            let (policy_name, verdict) = match self.phase.spawn_policy() {
                Some(policy) => (policy.name(), policy.check(participant, now)),
                None => ("none", Err(SpawnRejection::PhaseClosed)),
            };
            match verdict {
                Ok(()) => {
                    let team_locations = self
                        .phase
                        .spawn_policy()
                        .map_or(true, |policy| policy.team_locations);
                    self.spawn_participant(id, team_locations)?;
                }
                Err(rejection) => {
                    debug!(
                        participant_id = %id,
                        policy = policy_name,
                        reason = rejection.code(),
                        "Spawn rejected"
                    );
                    self.bus.publish(
                        now,
                        MatchEvent::SpawnRejected {
                            participant_id: id,
                            rejection,
                        },
                    );
                    if rejection.removes_participant() {
                        self.kick(id, rejection.code());
                    }
                }
            }
        }
        Ok(())
    }

    fn kick(&mut self, id: ParticipantId, reason: &str) {
        warn!(match_id = %self.state.id, participant_id = %id, reason, "Removing participant");
        self.bus.publish(
            self.state.tick,
            MatchEvent::ParticipantKicked {
                participant_id: id,
                reason: reason.to_string(),
            },
        );
        self.handle_leave(id, "kicked");
    }

    fn spawn_participant(&mut self, id: ParticipantId, team_locations: bool) -> Result<(), MatchError> {
        let now = self.state.tick;
        let Some(participant) = self.state.participants.get(&id) else {
            return Ok(());
        };
        let initial = participant.is_initial_spawn();
        let request = PlacementRequest {
            team: participant.team,
            has_mount: participant.loadout.has_mount,
            is_initial_spawn: initial && team_locations,
        };
        let bodies = self.state.active_bodies(Some(id));
        let candidate = PlacementSystem::select(
            &self.config.map.spawn_candidates,
            &request,
            &bodies,
            &mut self.state.rng,
        )?;
        let location_id = candidate.location_id.clone();
        let position = candidate.position;

        let Some(participant) = self.state.participants.get_mut(&id) else {
            return Ok(());
        };
        participant.has_active_body = true;
        participant.last_spawn_tick = Some(now);
        participant.position = position;
        participant.restore();
        let team = participant.team;

        self.bus.publish(
            now,
            MatchEvent::ParticipantSpawned {
                participant_id: id,
                location_id,
                team,
                initial,
            },
        );
        Ok(())
    }
}
