//! The Selector (C2) — picks one key per call.
//!
//! Deterministic given identical inputs: never returns an excluded or
//! penalized key.

use crate::keytable::KeyTable;
use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no eligible key: all {total} keys are excluded or penalized")]
pub struct NoKeyAvailable {
    pub total: usize,
}

/// Recent-usage hint: per-key request count over the last two wall-clock
/// hours, supplied by the usage store. May be absent (cold path) for any
/// given key, in which case it is treated as zero (most eligible).
pub type UsageHint = HashMap<usize, u64>;

/// Rank eligible indices by ascending recent usage, tie-break by smallest
/// index, and return the highest-ranked (least-used) one.
pub fn select(table: &KeyTable, exclude: &HashSet<usize>, hint: &UsageHint) -> Result<usize, NoKeyAvailable> {
    let mut eligible = table.eligible_indices(exclude);
    if eligible.is_empty() {
        return Err(NoKeyAvailable { total: table.len() });
    }
    eligible.sort_by_key(|&i| (hint.get(&i).copied().unwrap_or(0), i));
    Ok(eligible[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keytable::KeyTable;

    #[test]
    fn picks_least_used_eligible_key() {
        let table = KeyTable::new(vec!["a".into(), "b".into(), "c".into()]);
        let mut hint = UsageHint::new();
        hint.insert(0, 50);
        hint.insert(1, 5);
        hint.insert(2, 30);
        let picked = select(&table, &HashSet::new(), &hint).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn ties_break_on_smallest_index() {
        let table = KeyTable::new(vec!["a".into(), "b".into()]);
        let picked = select(&table, &HashSet::new(), &UsageHint::new()).unwrap();
        assert_eq!(picked, 0);
    }

    #[test]
    fn never_returns_excluded_key() {
        let table = KeyTable::new(vec!["a".into(), "b".into()]);
        let mut exclude = HashSet::new();
        exclude.insert(0usize);
        let picked = select(&table, &exclude, &UsageHint::new()).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn never_returns_penalized_key() {
        let table = KeyTable::new(vec!["a".into(), "b".into()]);
        table.update(1, |s, now| {
            s.penalty_until = Some(now + chrono::Duration::hours(1));
        });
        let picked = select(&table, &HashSet::new(), &UsageHint::new()).unwrap();
        assert_eq!(picked, 0);
    }

    #[test]
    fn fails_when_all_keys_excluded_or_penalized() {
        let table = KeyTable::new(vec!["a".into()]);
        let mut exclude = HashSet::new();
        exclude.insert(0usize);
        assert!(select(&table, &exclude, &UsageHint::new()).is_err());
    }

    #[test]
    fn deterministic_given_identical_inputs() {
        let table = KeyTable::new(vec!["a".into(), "b".into(), "c".into()]);
        let mut hint = UsageHint::new();
        hint.insert(0, 10);
        hint.insert(2, 10);
        let exclude = HashSet::new();
        let a = select(&table, &exclude, &hint).unwrap();
        let b = select(&table, &exclude, &hint).unwrap();
        assert_eq!(a, b);
    }
}
