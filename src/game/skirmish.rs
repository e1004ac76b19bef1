//! Match-end predicate for non-survival modes

use super::timer::Countdown;
use super::{MatchOutcome, Participant, Team};

/// Decides when a match outside survival mode is over
pub trait MatchEndPredicate: Send {
    /// Called once when the match goes live
    fn begin(&mut self, now_tick: u64);
    fn check<'a>(
        &self,
        now_tick: u64,
        participants: &mut dyn Iterator<Item = &'a Participant>,
    ) -> Option<MatchOutcome>;
}

/// Ends on the time limit (draw) or as soon as one team has nobody left
pub struct TimeLimit {
    limit_secs: f32,
    countdown: Option<Countdown>,
}

impl TimeLimit {
    pub fn new(limit_secs: f32) -> Self {
        Self {
            limit_secs,
            countdown: None,
        }
    }
}

impl MatchEndPredicate for TimeLimit {
    fn begin(&mut self, now_tick: u64) {
        self.countdown = Some(Countdown::start(self.limit_secs, now_tick));
    }

    fn check<'a>(
        &self,
        now_tick: u64,
        participants: &mut dyn Iterator<Item = &'a Participant>,
    ) -> Option<MatchOutcome> {
        let countdown = self.countdown?;

        let (mut attackers, mut defenders) = (0usize, 0usize);
        for participant in participants {
            match participant.team {
                Team::Attackers => attackers += 1,
                Team::Defenders => defenders += 1,
            }
        }
        match (attackers, defenders) {
            (0, 0) => return Some(MatchOutcome::Draw),
            (0, _) => return Some(MatchOutcome::Won(Team::Defenders)),
            (_, 0) => return Some(MatchOutcome::Won(Team::Attackers)),
            _ => {}
        }

        if countdown.has_expired(now_tick) {
            Some(MatchOutcome::Draw)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time::secs_to_ticks;
    use uuid::Uuid;

    fn roster() -> Vec<Participant> {
        vec![
            Participant::new(Uuid::new_v4(), "a".into(), Team::Attackers, 0),
            Participant::new(Uuid::new_v4(), "d".into(), Team::Defenders, 0),
        ]
    }

    #[test]
    fn silent_until_started() {
        let predicate = TimeLimit::new(10.0);
        let everyone = roster();
        assert_eq!(predicate.check(1_000_000, &mut everyone.iter()), None);
    }

    #[test]
    fn time_limit_ends_in_draw() {
        let mut predicate = TimeLimit::new(10.0);
        predicate.begin(100);
        let everyone = roster();
        assert_eq!(predicate.check(101, &mut everyone.iter()), None);
        assert_eq!(
            predicate.check(100 + secs_to_ticks(10.0), &mut everyone.iter()),
            Some(MatchOutcome::Draw)
        );
    }

    #[test]
    fn abandoned_team_loses() {
        let mut predicate = TimeLimit::new(10.0);
        predicate.begin(0);
        let everyone = roster();
        let defenders_only = everyone.iter().filter(|p| p.team == Team::Defenders);
        assert_eq!(
            predicate.check(1, &mut defenders_only.into_iter()),
            Some(MatchOutcome::Won(Team::Defenders))
        );
    }
}
