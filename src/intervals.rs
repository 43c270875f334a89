//! Closed-interval arithmetic over block numbers.
//!
//! The historical driver reasons about "which block ranges are already cached
//! for this fragment" as sets of inclusive `[lo, hi]` ranges. Everything here
//! treats endpoints as inclusive and keeps sets sorted and non-overlapping.

use serde::{Deserialize, Serialize};

/// A closed range of block numbers.
pub type Interval = (u64, u64);

/// Sorted, coalesced set of closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet(Vec<Interval>);

fn check(interval: &Interval) {
    assert!(
        interval.0 <= interval.1,
        "malformed interval [{}, {}]",
        interval.0,
        interval.1
    );
}

impl IntervalSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a set from arbitrary (possibly unsorted, overlapping) intervals.
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut ranges: Vec<Interval> = intervals.into_iter().collect();
        for r in &ranges {
            check(r);
        }
        ranges.sort_by_key(|r| r.0);
        let mut out: Vec<Interval> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                // Touching ranges coalesce: [a,b] + [b+1,c] = [a,c].
                Some(last) if r.0 <= last.1.saturating_add(1) => last.1 = last.1.max(r.1),
                _ => out.push(r),
            }
        }
        Self(out)
    }

    pub fn single(lo: u64, hi: u64) -> Self {
        Self::from_intervals([(lo, hi)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.0
    }

    /// Total number of blocks covered.
    pub fn len_blocks(&self) -> u64 {
        self.0.iter().map(|(lo, hi)| hi - lo + 1).sum()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.0.iter().any(|&(lo, hi)| lo <= block && block <= hi)
    }

    pub fn insert(&mut self, interval: Interval) {
        check(&interval);
        let mut ranges = std::mem::take(&mut self.0);
        ranges.push(interval);
        *self = Self::from_intervals(ranges);
    }

    /// Set union.
    pub fn union(&self, other: &Self) -> Self {
        Self::from_intervals(self.0.iter().chain(other.0.iter()).copied())
    }

    /// Set intersection, a sweep over both sorted inputs.
    pub fn intersection(&self, other: &Self) -> Self {
        let (mut i, mut j) = (0, 0);
        let mut out = Vec::new();
        while i < self.0.len() && j < other.0.len() {
            let a = self.0[i];
            let b = other.0[j];
            let lo = a.0.max(b.0);
            let hi = a.1.min(b.1);
            if lo <= hi {
                out.push((lo, hi));
            }
            if a.1 < b.1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self(out)
    }

    /// Fold of `intersection` over a non-empty list of sets.
    ///
    /// Panics on an empty list: intersecting nothing has no meaningful
    /// identity over an unbounded domain.
    pub fn intersection_many(sets: &[IntervalSet]) -> Self {
        let (first, rest) = sets
            .split_first()
            .expect("intersection_many over an empty list");
        rest.iter().fold(first.clone(), |acc, s| acc.intersection(s))
    }

    /// Set difference: `self` minus every point covered by `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        for &(lo, hi) in &self.0 {
            let mut cursor = lo;
            for &(b_lo, b_hi) in &other.0 {
                if b_hi < cursor {
                    continue;
                }
                if b_lo > hi {
                    break;
                }
                if b_lo > cursor {
                    out.push((cursor, b_lo - 1));
                }
                cursor = b_hi.saturating_add(1);
                if cursor > hi {
                    break;
                }
            }
            if cursor <= hi {
                out.push((cursor, hi));
            }
        }
        Self(out)
    }
}

impl FromIterator<Interval> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Self {
        Self::from_intervals(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[Interval]) -> IntervalSet {
        IntervalSet::from_intervals(ranges.iter().copied())
    }

    fn arbitrary(rng: &mut fastrand::Rng) -> IntervalSet {
        let n = rng.usize(0..5);
        IntervalSet::from_intervals((0..n).map(|_| {
            let lo = rng.u64(0..100);
            (lo, lo + rng.u64(0..20))
        }))
    }

    #[test]
    fn construction_sorts_and_coalesces() {
        assert_eq!(
            set(&[(10, 12), (0, 3), (4, 6), (11, 20)]).intervals(),
            &[(0, 6), (10, 20)]
        );
        // Touching endpoints merge, a gap of one block does not.
        assert_eq!(set(&[(0, 3), (4, 6)]).intervals(), &[(0, 6)]);
        assert_eq!(set(&[(0, 3), (5, 6)]).intervals(), &[(0, 3), (5, 6)]);
    }

    #[test]
    fn union_is_commutative() {
        let mut rng = fastrand::Rng::with_seed(3);
        for _ in 0..200 {
            let a = arbitrary(&mut rng);
            let b = arbitrary(&mut rng);
            assert_eq!(a.union(&b), b.union(&a));
        }
    }

    #[test]
    fn intersection_identity() {
        let mut rng = fastrand::Rng::with_seed(5);
        for _ in 0..200 {
            let a = arbitrary(&mut rng);
            assert_eq!(a.intersection(&a), a);
        }
    }

    #[test]
    fn difference_with_empty_is_identity() {
        let mut rng = fastrand::Rng::with_seed(9);
        for _ in 0..200 {
            let a = arbitrary(&mut rng);
            assert_eq!(a.difference(&IntervalSet::new()), a);
        }
    }

    #[test]
    fn difference_union_intersection_partitions() {
        // difference(A, B) ∪ intersection(A, B) = A
        let mut rng = fastrand::Rng::with_seed(17);
        for _ in 0..500 {
            let a = arbitrary(&mut rng);
            let b = arbitrary(&mut rng);
            assert_eq!(a.difference(&b).union(&a.intersection(&b)), a, "a={a:?} b={b:?}");
        }
    }

    #[test]
    fn intersection_sweep() {
        let a = set(&[(0, 10), (20, 30)]);
        let b = set(&[(5, 25)]);
        assert_eq!(a.intersection(&b).intervals(), &[(5, 10), (20, 25)]);
    }

    #[test]
    fn intersection_many_folds() {
        let sets = vec![set(&[(0, 100)]), set(&[(10, 50)]), set(&[(20, 80)])];
        assert_eq!(
            IntervalSet::intersection_many(&sets).intervals(),
            &[(20, 50)]
        );
    }

    #[test]
    fn difference_splits_ranges() {
        let a = set(&[(0, 100)]);
        let b = set(&[(10, 20), (40, 50)]);
        assert_eq!(
            a.difference(&b).intervals(),
            &[(0, 9), (21, 39), (51, 100)]
        );
    }

    #[test]
    #[should_panic(expected = "malformed interval")]
    fn inverted_interval_panics() {
        IntervalSet::single(10, 5);
    }
}
