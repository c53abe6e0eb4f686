use std::collections::BTreeMap;

use crate::tail::{TailId, TailSet};
use crate::{StateId, Time};

/// One transition of the hybrid automaton: an inclusive time range for one
/// symbol, the multiset of tails whose first delay falls into the range, and
/// the target state the transition leads to.
///
/// The two undo slots are written by the reversible refinement operations so
/// a `point` can be rolled back exactly.
#[derive(Clone, Debug)]
pub struct Interval {
    begin: Time,
    end: Time,
    tails: TailSet,
    target: Option<StateId>,
    num_marked: usize,
    undo_target: Option<StateId>,
    undo_tails: Option<TailSet>,
}

impl Interval {
    fn new(begin: Time, end: Time) -> Self {
        Self {
            begin,
            end,
            tails: TailSet::new(),
            target: None,
            num_marked: 0,
            undo_target: None,
            undo_tails: None,
        }
    }

    /// Inclusive lower bound.
    pub fn begin(&self) -> Time {
        self.begin
    }

    /// Inclusive upper bound.
    pub fn end(&self) -> Time {
        self.end
    }

    /// The target state, if any.
    pub fn target(&self) -> Option<StateId> {
        self.target
    }

    /// Redirect the transition.
    pub fn set_target(&mut self, target: Option<StateId>) {
        self.target = target;
    }

    /// Clear and return the target.
    pub fn take_target(&mut self) -> Option<StateId> {
        self.target.take()
    }

    /// The stored tails.
    pub fn tails(&self) -> &TailSet {
        &self.tails
    }

    /// Mutable access to the stored tails, for splicing.
    pub fn tails_mut(&mut self) -> &mut TailSet {
        &mut self.tails
    }

    /// Store a tail; its delay must fall into the range.
    pub fn add_tail(&mut self, time: Time, tail: TailId) {
        debug_assert!(self.begin <= time && time <= self.end);
        self.tails.insert(time, tail);
    }

    /// Remove a stored tail.
    pub fn del_tail(&mut self, time: Time, tail: TailId) {
        self.tails.remove(time, tail);
    }

    /// Whether the given tail is stored here.
    pub fn contains_tail(&self, time: Time, tail: TailId) -> bool {
        self.tails.contains(time, tail)
    }

    /// Whether no tail is stored.
    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }

    /// Number of stored tails.
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    /// Note one more marked tail.
    pub fn add_marked(&mut self) {
        self.num_marked += 1;
    }

    /// Note one marked tail less.
    pub fn del_marked(&mut self) {
        self.num_marked -= 1;
    }

    /// Number of currently marked tails.
    pub fn num_marked(&self) -> usize {
        self.num_marked
    }

    /// Write the undo slot for the old target.
    pub fn set_undo_target(&mut self, target: Option<StateId>) {
        self.undo_target = target;
    }

    /// Clear and return the saved old target.
    pub fn take_undo_target(&mut self) -> Option<StateId> {
        self.undo_target.take()
    }

    /// Write the undo snapshot of the tail multiset.
    pub fn set_undo_tails(&mut self, tails: Option<TailSet>) {
        self.undo_tails = tails;
    }

    /// Clear and return the saved tail snapshot.
    pub fn take_undo_tails(&mut self) -> Option<TailSet> {
        self.undo_tails.take()
    }
}

/// The ordered partition of `[min_time, max_time]` into intervals for one
/// (state, symbol) pair, keyed by interval end so the interval containing a
/// delay is found by a lower-bound lookup.
#[derive(Clone, Debug)]
pub struct IntervalPartition {
    by_end: BTreeMap<Time, Interval>,
}

impl IntervalPartition {
    /// The initial shape: a single interval covering the whole axis.
    pub fn new(min_time: Time, max_time: Time) -> Self {
        let mut by_end = BTreeMap::new();
        by_end.insert(max_time, Interval::new(min_time, max_time));
        Self { by_end }
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.by_end.len()
    }

    /// A partition always covers the whole axis.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// End of the leftmost interval.
    pub fn first_end(&self) -> Time {
        *self.by_end.keys().next().expect("partition is never empty")
    }

    /// The interval whose range contains `t`, or the rightmost interval for
    /// delays beyond the axis.
    pub fn lookup(&self, t: Time) -> &Interval {
        match self.by_end.range(t..).next() {
            Some((_, interval)) => interval,
            None => self
                .by_end
                .values()
                .next_back()
                .expect("partition is never empty"),
        }
    }

    /// Mutable variant of [`Self::lookup`].
    pub fn lookup_mut(&mut self, t: Time) -> &mut Interval {
        if self.by_end.range(t..).next().is_none() {
            return self
                .by_end
                .values_mut()
                .next_back()
                .expect("partition is never empty");
        }
        self.by_end
            .range_mut(t..)
            .next()
            .map(|(_, interval)| interval)
            .expect("checked above")
    }

    /// Split the interval containing `t` into `[begin, t]` and `[t+1, end]`.
    /// The new left interval receives the tails with delay `<= t`; the right
    /// keeps the rest along with the target pointer.
    pub fn split(&mut self, t: Time) {
        let (_, interval) = self
            .by_end
            .range_mut(t..)
            .next()
            .expect("split time beyond the partition");
        assert!(
            interval.begin <= t && t < interval.end,
            "split time must lie strictly inside an interval"
        );
        let mut left = Interval::new(interval.begin, t);
        left.tails = interval.tails.split_below(t);
        interval.begin = t + 1;
        self.by_end.insert(t, left);
    }

    /// Fold the interval ending at `t` back into its right neighbour,
    /// undoing a [`Self::split`] at the same time value. The right
    /// neighbour keeps its target pointer.
    pub fn undo_split(&mut self, t: Time) {
        let left = self
            .by_end
            .remove(&t)
            .expect("no interval ends at the undo time");
        debug_assert!(left.target.is_none());
        debug_assert_eq!(left.num_marked, 0);
        let (_, right) = self
            .by_end
            .range_mut(t + 1..)
            .next()
            .expect("undo_split requires a right neighbour");
        assert_eq!(right.begin, t + 1);
        right.begin = left.begin;
        right.tails.append(left.tails);
    }

    /// The intervals in ascending end order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Interval> {
        self.by_end.values()
    }

    /// The interval end times in ascending order.
    pub fn ends(&self) -> impl DoubleEndedIterator<Item = Time> + '_ {
        self.by_end.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::TailId;

    fn tail(word: u32) -> TailId {
        TailId { word, index: 0 }
    }

    #[test]
    fn lookup_boundaries() {
        let mut partition = IntervalPartition::new(0, 10);
        partition.split(4);
        assert_eq!(partition.lookup(0).end(), 4);
        assert_eq!(partition.lookup(4).end(), 4);
        assert_eq!(partition.lookup(5).end(), 10);
        assert_eq!(partition.lookup(10).end(), 10);
        // Beyond the axis the rightmost interval answers.
        assert_eq!(partition.lookup(99).end(), 10);
    }

    #[test]
    fn split_moves_the_low_tails() {
        let mut partition = IntervalPartition::new(0, 10);
        let interval = partition.lookup_mut(0);
        interval.add_tail(2, tail(0));
        interval.add_tail(4, tail(1));
        interval.add_tail(5, tail(2));
        partition.split(4);
        let left = partition.lookup(4);
        let right = partition.lookup(5);
        assert_eq!((left.begin(), left.end()), (0, 4));
        assert_eq!((right.begin(), right.end()), (5, 10));
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 1);
        assert!(left.contains_tail(4, tail(1)));
        assert!(right.contains_tail(5, tail(2)));
    }

    #[test]
    fn undo_split_restores_the_partition() {
        let mut partition = IntervalPartition::new(0, 10);
        let interval = partition.lookup_mut(0);
        interval.add_tail(2, tail(0));
        interval.add_tail(7, tail(1));
        partition.split(4);
        partition.undo_split(4);
        assert_eq!(partition.len(), 1);
        let whole = partition.lookup(0);
        assert_eq!((whole.begin(), whole.end()), (0, 10));
        assert_eq!(whole.len(), 2);
    }

    #[test]
    #[should_panic(expected = "strictly inside")]
    fn splitting_at_the_end_is_forbidden() {
        let mut partition = IntervalPartition::new(0, 10);
        partition.split(10);
    }
}
