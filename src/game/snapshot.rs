//! Periodic lifecycle snapshots

use std::collections::HashMap;

use crate::ws::protocol::{LifecycleSnapshot, ParticipantSnapshot, ServerMsg};

use super::phase::Phase;
use super::survival::RoundState;
use super::timer::Countdown;
use super::{Participant, ParticipantId};

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (phase changes)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    pub fn build(
        &self,
        tick: u64,
        phase: Phase,
        countdown: Option<Countdown>,
        round: Option<RoundState>,
        participants: &HashMap<ParticipantId, Participant>,
        units_alive: u32,
    ) -> ServerMsg {
        let mut participant_snapshots: Vec<ParticipantSnapshot> = participants
            .values()
            .map(|p| ParticipantSnapshot {
                participant_id: p.id,
                display_name: p.display_name.clone(),
                team: p.team,
                has_active_body: p.has_active_body,
                x: p.position.x,
                y: p.position.y,
                health: p.health,
                ammo: p.ammo,
                ready: p.ready,
            })
            .collect();
        participant_snapshots.sort_by_key(|p| p.participant_id);

        ServerMsg::Snapshot(LifecycleSnapshot {
            tick,
            phase,
            phase_remaining_secs: countdown.map(|c| c.remaining(tick)),
            round,
            participants: participant_snapshots,
            units_alive,
        })
    }
}
