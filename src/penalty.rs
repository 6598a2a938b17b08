//! Penalty Policy (C7) — a pure decision layer keyed on outcome kind.
//! Same inputs, same outputs; `now` is an explicit argument so tests can
//! drive it deterministically.

use chrono::{DateTime, Duration, Utc};

/// Rate-limit penalty ladder: 15m, 1h, 2h, 6h, 12h, 24h.
const LADDER_MINUTES: [i64; 6] = [15, 60, 120, 360, 720, 1440];

/// Fixed transient penalty for `UpstreamTransient` / `LocalError`.
const TRANSIENT_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    UpstreamTransient,
    UpstreamClientError,
    LocalError,
    Cancelled,
}

/// The effect a penalty decision has on a key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    pub penalty_until: DateTime<Utc>,
    pub new_backoff_level: u8,
}

/// Decide the penalty for `outcome` given the key's current backoff level
/// and `now`. Returns `None` for outcomes that never penalize
/// (`UpstreamClientError`, `Cancelled`, `Success`).
pub fn decide(outcome: Outcome, current_backoff_level: u8, now: DateTime<Utc>) -> Option<Penalty> {
    match outcome {
        Outcome::RateLimited => {
            // Deadline uses the *current* rung (so the first 429 gets the
            // ladder's first step, 15m) while backoff_level still advances,
            // so the next 429 lands on a longer deadline.
            let current_idx = (current_backoff_level as usize).min(LADDER_MINUTES.len() - 1);
            let minutes = LADDER_MINUTES[current_idx];
            let next_level = (current_backoff_level as usize + 1).min(LADDER_MINUTES.len() - 1);
            Some(Penalty {
                penalty_until: now + Duration::minutes(minutes),
                new_backoff_level: next_level as u8,
            })
        }
        Outcome::UpstreamTransient | Outcome::LocalError => Some(Penalty {
            penalty_until: now + Duration::seconds(TRANSIENT_SECONDS),
            new_backoff_level: current_backoff_level,
        }),
        Outcome::UpstreamClientError | Outcome::Cancelled | Outcome::Success => None,
    }
}

/// Duration of ladder step `level`, clamped to the top of the ladder.
/// Used by the Health Controller to re-apply a penalty at the
/// *current* level without advancing it further than a dispatch-path 429
/// would.
pub fn ladder_step(level: u8) -> Duration {
    let idx = (level as usize).min(LADDER_MINUTES.len() - 1);
    Duration::minutes(LADDER_MINUTES[idx])
}

pub const LADDER_LEN: usize = LADDER_MINUTES.len();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_advances_one_level_and_sets_ladder_deadline() {
        let now = Utc::now();
        let p = decide(Outcome::RateLimited, 0, now).unwrap();
        assert_eq!(p.new_backoff_level, 1);
        assert_eq!(p.penalty_until, now + Duration::minutes(15));
    }

    #[test]
    fn second_rate_limit_uses_the_next_rung() {
        let now = Utc::now();
        let p = decide(Outcome::RateLimited, 1, now).unwrap();
        assert_eq!(p.new_backoff_level, 2);
        assert_eq!(p.penalty_until, now + Duration::hours(1));
    }

    #[test]
    fn rate_limit_saturates_at_ladder_top() {
        let now = Utc::now();
        let p = decide(Outcome::RateLimited, (LADDER_LEN - 1) as u8, now).unwrap();
        assert_eq!(p.new_backoff_level as usize, LADDER_LEN - 1);
        assert_eq!(p.penalty_until, now + Duration::days(1));
    }

    #[test]
    fn transient_does_not_advance_backoff_level() {
        let now = Utc::now();
        let p = decide(Outcome::UpstreamTransient, 2, now).unwrap();
        assert_eq!(p.new_backoff_level, 2);
        assert_eq!(p.penalty_until, now + Duration::seconds(30));

        let p2 = decide(Outcome::LocalError, 2, now).unwrap();
        assert_eq!(p2.new_backoff_level, 2);
        assert_eq!(p2.penalty_until, now + Duration::seconds(30));
    }

    #[test]
    fn terminal_outcomes_never_penalize() {
        let now = Utc::now();
        assert!(decide(Outcome::Success, 0, now).is_none());
        assert!(decide(Outcome::UpstreamClientError, 0, now).is_none());
        assert!(decide(Outcome::Cancelled, 0, now).is_none());
    }

    #[test]
    fn same_inputs_same_outputs() {
        let now = Utc::now();
        let a = decide(Outcome::RateLimited, 3, now);
        let b = decide(Outcome::RateLimited, 3, now);
        assert_eq!(a, b);
    }
}
