//! Spawn placement - picks the location a (re)spawning participant enters at

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::game::{Position, Team};

/// Penalty applied to a candidate that cannot take the requester's mount state
pub const MOUNT_MISMATCH_PENALTY: f32 = -1000.0;
/// Upper bound (exclusive) of the random jitter added to every score
pub const MAX_JITTER: f32 = 2.0;
/// Proximity term at zero distance
const CROWD_PENALTY_BASE: f32 = 3.0;
/// Proximity term falloff per distance unit
const CROWD_PENALTY_FALLOFF: f32 = 0.15;

/// A placement location computed once per map load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnCandidate {
    pub location_id: String,
    pub position: Position,
    /// Team this location belongs to for initial spawns; `None` is neutral
    #[serde(default)]
    pub team: Option<Team>,
    #[serde(default)]
    pub excludes_mounted: bool,
    #[serde(default)]
    pub excludes_unmounted: bool,
}

/// Something already occupying the map
#[derive(Debug, Clone, Copy)]
pub struct ActiveBody {
    pub position: Position,
    pub is_mount: bool,
}

/// Who is asking for a location
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest {
    pub team: Team,
    pub has_mount: bool,
    pub is_initial_spawn: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no spawn candidates available")]
    NoCandidates,
}

pub struct PlacementSystem;

impl PlacementSystem {
    /// Average crowding around `position`, as a non-positive score term.
    /// Mount bodies are ignored; each other body within 20 units contributes.
    pub fn proximity_penalty(position: Position, bodies: &[ActiveBody]) -> f32 {
        let mut considered = 0usize;
        let mut total = 0.0f32;
        for body in bodies.iter().filter(|b| !b.is_mount) {
            considered += 1;
            let term = CROWD_PENALTY_BASE - CROWD_PENALTY_FALLOFF * position.distance(body.position);
            if term > 0.0 {
                total += term;
            }
        }
        if considered == 0 {
            return 0.0;
        }
        -(total / considered as f32)
    }

    /// Fixed penalty when the candidate excludes the requester's mount state
    pub fn mount_penalty(candidate: &SpawnCandidate, has_mount: bool) -> f32 {
        let incompatible = (has_mount && candidate.excludes_mounted)
            || (!has_mount && candidate.excludes_unmounted);
        if incompatible {
            MOUNT_MISMATCH_PENALTY
        } else {
            0.0
        }
    }

    /// Score a candidate with an explicit jitter in `[0, MAX_JITTER)`
    pub fn score_candidate(
        candidate: &SpawnCandidate,
        request: &PlacementRequest,
        bodies: &[ActiveBody],
        jitter: f32,
    ) -> f32 {
        jitter
            + Self::proximity_penalty(candidate.position, bodies)
            + Self::mount_penalty(candidate, request.has_mount)
    }

    /// Candidates eligible for this request. Initial spawns prefer the requester's
    /// team locations and fall back to the whole set when the map has none.
    pub fn candidate_pool<'c>(
        candidates: &'c [SpawnCandidate],
        request: &PlacementRequest,
    ) -> Vec<&'c SpawnCandidate> {
        if request.is_initial_spawn {
            let team_pool: Vec<&SpawnCandidate> = candidates
                .iter()
                .filter(|c| c.team == Some(request.team))
                .collect();
            if !team_pool.is_empty() {
                return team_pool;
            }
        }
        candidates.iter().collect()
    }

    /// Pick the highest scoring candidate. Ties keep the first one encountered.
    pub fn select<'c, R: Rng>(
        candidates: &'c [SpawnCandidate],
        request: &PlacementRequest,
        bodies: &[ActiveBody],
        rng: &mut R,
    ) -> Result<&'c SpawnCandidate, PlacementError> {
        let mut best: Option<(&SpawnCandidate, f32)> = None;
        for candidate in Self::candidate_pool(candidates, request) {
            let jitter = rng.gen_range(0.0..MAX_JITTER);
            let score = Self::score_candidate(candidate, request, bodies, jitter);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((candidate, score)),
            }
        }
        best.map(|(c, _)| c).ok_or(PlacementError::NoCandidates)
    }
}
