//! Timelines: ordered deadline-to-atom maps consumed by the frame players.
//!
//! A key is a deadline — "show this atom no earlier than here". The player
//! picks the greatest key at or before the current instant; keys it had to
//! jump over are accounted as skips. Timelines are rebuilt wholesale every
//! main-loop tick and swapped in atomically, never edited in place.

use std::collections::BTreeMap;

use crate::clock::MonoTime;
use crate::display::DisplayAtom;

pub type Timeline = BTreeMap<MonoTime, DisplayAtom>;

/// True when both timelines wake the player on the same schedule: identical
/// key sets, atoms free to differ. The player uses this to skip a thread
/// wakeup when a tick re-derives the same deadline grid.
pub fn same_keys(a: &Timeline, b: &Timeline) -> bool {
    a.len() == b.len() && a.keys().eq(b.keys())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline(keys: &[u64]) -> Timeline {
        keys.iter()
            .map(|&ms| (MonoTime::from_millis(ms), DisplayAtom::default()))
            .collect()
    }

    /// Test: key-set comparison
    /// Validates: equality ignores atoms, detects any key difference
    #[test]
    fn test_same_keys() {
        assert!(same_keys(&timeline(&[]), &timeline(&[])));
        assert!(same_keys(&timeline(&[10, 20, 30]), &timeline(&[10, 20, 30])));
        assert!(!same_keys(&timeline(&[10, 20]), &timeline(&[10, 20, 30])));
        assert!(!same_keys(&timeline(&[10, 20, 30]), &timeline(&[10, 20, 31])));
        assert!(!same_keys(&timeline(&[10]), &timeline(&[])));
    }

    /// Test: key ordering and lookup shape used by the player
    /// Validates: greatest-at-or-before and first-after queries
    #[test]
    fn test_deadline_queries() {
        let tl = timeline(&[10, 20, 30]);
        let now = MonoTime::from_millis(25);

        let due = tl.range(..=now).next_back().map(|(&k, _)| k);
        assert_eq!(due, Some(MonoTime::from_millis(20)));

        let next = tl
            .range((std::ops::Bound::Excluded(now), std::ops::Bound::Unbounded))
            .next()
            .map(|(&k, _)| k);
        assert_eq!(next, Some(MonoTime::from_millis(30)));

        // A key equal to now counts as due, not future.
        let now = MonoTime::from_millis(20);
        let due = tl.range(..=now).next_back().map(|(&k, _)| k);
        assert_eq!(due, Some(MonoTime::from_millis(20)));
    }
}
