//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::phase::Phase;
use crate::game::rewards::RewardKey;
use crate::game::spawn::SpawnRejection;
use crate::game::survival::RoundState;
use crate::game::{Loadout, MatchOutcome, ParticipantId, Team};

/// Who is on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// A human participant
    #[default]
    Participant,
    /// The simulation engine reporting battlefield facts
    Engine,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Enter the session with the equipped loadout
    Join {
        #[serde(default)]
        loadout: Loadout,
    },

    /// Ask for a body; answered with `participant_spawned` or `spawn_rejected`
    RequestSpawn,

    UpdateLoadout {
        loadout: Loadout,
    },

    /// Current body position, used to spread out later spawns
    Position {
        x: f32,
        y: f32,
    },

    /// Vote to end warmup early
    Ready,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave the session
    Leave,

    // Engine-only reports
    UnitEliminated {
        unit_id: Uuid,
    },

    ParticipantDown {
        participant_id: ParticipantId,
    },

    CriticalUnitDestroyed,

    ForceStart,
}

impl ClientMsg {
    /// Battlefield facts only the engine connection may report
    pub fn is_engine_report(&self) -> bool {
        matches!(
            self,
            ClientMsg::UnitEliminated { .. }
                | ClientMsg::ParticipantDown { .. }
                | ClientMsg::CriticalUnitDestroyed
                | ClientMsg::ForceStart
        )
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        participant_id: ParticipantId,
        match_id: Uuid,
        server_time: u64,
        /// Simulation ticks per second, for converting announced start ticks
        tick_rate: u32,
        /// Tick the session was on when the connection was accepted
        tick: u64,
    },

    /// Lifecycle event, stamped with the tick it was decided on
    Event {
        tick: u64,
        event: MatchEvent,
    },

    /// Periodic lifecycle state
    Snapshot(LifecycleSnapshot),

    /// The session hit an unrecoverable error and stopped
    SessionTerminated {
        reason: String,
    },

    /// The session closed normally after the match ended
    SessionClosed {
        outcome: Option<MatchOutcome>,
    },

    /// Error addressed to one connection
    Error {
        participant_id: ParticipantId,
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        participant_id: ParticipantId,
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    /// Connection a message is meant for; `None` goes to everyone
    pub fn recipient(&self) -> Option<ParticipantId> {
        match self {
            ServerMsg::Error { participant_id, .. } | ServerMsg::Pong { participant_id, .. } => {
                Some(*participant_id)
            }
            _ => None,
        }
    }

    pub fn is_for(&self, participant_id: ParticipantId) -> bool {
        self.recipient().map_or(true, |to| to == participant_id)
    }
}

/// Lifecycle events published by a match session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum MatchEvent {
    /// Clients derive the remaining time from `start_tick` and `duration_secs`
    PhaseChanged {
        phase: Phase,
        start_tick: u64,
        duration_secs: f32,
    },

    RoundStarted {
        round_index: u32,
        start_tick: u64,
    },

    WaveCountdown {
        round_index: u32,
        next_wave_index: i32,
        start_tick: u64,
        duration_secs: f32,
    },

    WaveStarted {
        round_index: u32,
        wave_index: i32,
        start_tick: u64,
        unit_count: u32,
    },

    WaveCleared {
        round_index: u32,
        wave_index: i32,
    },

    RoundRewarded {
        round_index: u32,
        waves_won: u32,
        amount: f64,
        recipients: usize,
    },

    MatchEnded {
        outcome: MatchOutcome,
    },

    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
        team: Team,
    },

    ParticipantLeft {
        participant_id: ParticipantId,
        reason: String,
    },

    TeamAssigned {
        participant_id: ParticipantId,
        team: Team,
    },

    ParticipantSpawned {
        participant_id: ParticipantId,
        location_id: String,
        team: Team,
        initial: bool,
    },

    SpawnRejected {
        participant_id: ParticipantId,
        rejection: SpawnRejection,
    },

    ParticipantKicked {
        participant_id: ParticipantId,
        reason: String,
    },

    UnitsSpawned {
        wave_index: i32,
        units: Vec<UnitInfo>,
    },

    RewardApplied {
        participant_id: ParticipantId,
        key: RewardKey,
        amount: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub unit_id: Uuid,
    pub kind: String,
    pub location_id: String,
}

/// Lifecycle state sent at the snapshot rate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSnapshot {
    pub tick: u64,
    pub phase: Phase,
    /// Seconds left on the phase countdown, if it has one
    pub phase_remaining_secs: Option<f32>,
    /// Survival only
    pub round: Option<RoundState>,
    pub participants: Vec<ParticipantSnapshot>,
    pub units_alive: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub team: Team,
    pub has_active_body: bool,
    pub x: f32,
    pub y: f32,
    pub health: f32,
    pub ammo: u32,
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"request_spawn"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::RequestSpawn));

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        match msg {
            ClientMsg::Join { loadout } => assert!(!loadout.has_usable_weapon()),
            other => panic!("unexpected {:?}", other),
        }

        let msg: ClientMsg = serde_json::from_str(
            r#"{"type":"update_loadout","loadout":{"weapons":[{"item_id":"bow"}],"has_mount":true}}"#,
        )
        .unwrap();
        match msg {
            ClientMsg::UpdateLoadout { loadout } => {
                assert!(loadout.has_usable_weapon());
                assert!(loadout.has_mount);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn engine_reports_are_flagged() {
        assert!(ClientMsg::ForceStart.is_engine_report());
        assert!(ClientMsg::CriticalUnitDestroyed.is_engine_report());
        assert!(!ClientMsg::Ready.is_engine_report());
        assert!(!ClientMsg::RequestSpawn.is_engine_report());
    }

    #[test]
    fn spawn_rejection_carries_retry_hint() {
        let msg = ServerMsg::Event {
            tick: 40,
            event: MatchEvent::SpawnRejected {
                participant_id: Uuid::nil(),
                rejection: SpawnRejection::CooldownActive { retry_in_secs: 1.5 },
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["tick"], 40);
        assert_eq!(value["event"]["event_type"], "spawn_rejected");
        assert_eq!(value["event"]["rejection"]["reason"], "cooldown_active");
        assert_eq!(value["event"]["rejection"]["retry_in_secs"], 1.5);
    }

    #[test]
    fn addressed_messages_only_reach_their_recipient() {
        let joiner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let full = ServerMsg::Error {
            participant_id: joiner,
            code: "match_full".into(),
            message: "Match is full".into(),
        };
        assert!(full.is_for(joiner));
        assert!(!full.is_for(other));

        let terminated = ServerMsg::SessionTerminated { reason: "x".into() };
        assert!(terminated.is_for(joiner) && terminated.is_for(other));
    }

    #[test]
    fn phase_change_announces_start_tick_and_duration() {
        let msg = ServerMsg::Event {
            tick: 90,
            event: MatchEvent::PhaseChanged {
                phase: Phase::WarmupEnding,
                start_tick: 90,
                duration_secs: 30.0,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"]["phase"], "warmup_ending");
        assert_eq!(value["event"]["start_tick"], 90);
        assert_eq!(value["event"]["duration_secs"], 30.0);
    }
}
