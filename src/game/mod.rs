//! Match lifecycle modules

pub mod events;
pub mod r#match;
pub mod phase;
pub mod rewards;
pub mod roster;
pub mod skirmish;
pub mod snapshot;
pub mod spawn;
pub mod survival;
pub mod timer;

pub use r#match::{GameMatch, MatchError, MatchHandle, MatchRegistry};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ws::protocol::ClientMsg;

pub type ParticipantId = Uuid;

/// Full health restored at every wave start
pub const MAX_HEALTH: f32 = 100.0;
/// Full ammunition restored at every wave start
pub const MAX_AMMO: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Attackers,
    Defenders,
}

/// Which side won a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Won(Team),
    Draw,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[cfg(test)]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponSlot {
    pub item_id: String,
    /// Broken, empty or otherwise unusable weapons are still equipped but do not count
    #[serde(default = "default_usable")]
    pub usable: bool,
}

fn default_usable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Loadout {
    #[serde(default)]
    pub weapons: Vec<WeaponSlot>,
    #[serde(default)]
    pub has_mount: bool,
}

impl Loadout {
    /// Single usable sidearm
    #[cfg(test)]
    pub fn basic() -> Self {
        Self {
            weapons: vec![WeaponSlot {
                item_id: "sidearm".to_string(),
                usable: true,
            }],
            has_mount: false,
        }
    }

    pub fn has_usable_weapon(&self) -> bool {
        self.weapons.iter().any(|w| w.usable)
    }
}

/// A connected participant (authoritative)
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub team: Team,
    pub has_active_body: bool,
    pub last_spawn_tick: Option<u64>,
    pub loadout: Loadout,
    pub position: Position,
    pub health: f32,
    pub ammo: u32,
    /// Sits out the wave that was running when they joined
    pub excluded_from_wave: bool,
    /// Voted to end warmup early
    pub ready: bool,
    pub joined_tick: u64,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: String, team: Team, joined_tick: u64) -> Self {
        Self {
            id,
            display_name,
            team,
            has_active_body: false,
            last_spawn_tick: None,
            loadout: Loadout::default(),
            position: Position::default(),
            health: MAX_HEALTH,
            ammo: MAX_AMMO,
            excluded_from_wave: false,
            ready: false,
            joined_tick,
        }
    }

    /// Remove the body and forget spawn history so the next spawn counts as initial
    pub fn reset_body(&mut self) {
        self.has_active_body = false;
        self.last_spawn_tick = None;
        self.health = MAX_HEALTH;
        self.ammo = MAX_AMMO;
    }

    pub fn restore(&mut self) {
        self.health = MAX_HEALTH;
        self.ammo = MAX_AMMO;
    }

    pub fn is_initial_spawn(&self) -> bool {
        self.last_spawn_tick.is_none()
    }
}

/// Server-spawned opposing unit in survival mode
#[derive(Debug, Clone)]
pub struct OpposingUnit {
    pub id: Uuid,
    pub kind: String,
    pub position: Position,
    pub alive: bool,
}

/// Input forwarded to a match session from a connection
#[derive(Debug, Clone)]
pub struct SessionInput {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub msg: ClientMsg,
}
