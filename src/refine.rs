//! The reversible merge/split engine.
//!
//! All operations come in apply/undo pairs that leave the automaton
//! bit-identical when run back to back. Apply walks symbols and intervals in
//! ascending order, undo in descending order. A merge never destroys the
//! detached tree subtree: its tail buckets are copied, not moved, so the
//! undo path can read from them.

use tracing::trace;

use rtinfer_core::prelude::*;

use crate::automaton::Automaton;
use crate::state::TimedState;

impl Automaton {
    /// Split the interval of `symbol` containing `time` at `time`. If both
    /// halves end up with tails, the new left half gets a fresh tree target
    /// and the successor tails of its tails are propagated into a cloned
    /// subtree; if only the left half has tails it steals the old target.
    pub fn split(&mut self, state: StateId, symbol: usize, time: Time) {
        trace!(?state, symbol, time, "split");
        self.states[state].partition_mut(symbol).split(time);
        if self.states[state].interval(symbol, time).is_empty() {
            return;
        }
        if !self.states[state].interval(symbol, time + 1).is_empty() {
            let old_target = self.states[state]
                .interval(symbol, time + 1)
                .target()
                .expect("a populated interval always has a target");
            let fresh = self.states.insert(TimedState::new(&self.params));
            self.states[state]
                .interval_mut(symbol, time)
                .set_target(Some(fresh));
            self.recurse_split(state, symbol, time, old_target);
        } else {
            let target = self.states[state].interval_mut(symbol, time + 1).take_target();
            self.states[state].interval_mut(symbol, time).set_target(target);
        }
    }

    /// Exact inverse of [`Self::split`] at the same time value.
    pub fn undo_split(&mut self, state: StateId, symbol: usize, time: Time) {
        trace!(?state, symbol, time, "undo split");
        if !self.states[state].interval(symbol, time).is_empty() {
            if !self.states[state].interval(symbol, time + 1).is_empty() {
                let old_target = self.states[state]
                    .interval(symbol, time + 1)
                    .target()
                    .expect("a populated interval always has a target");
                self.recurse_un_split(state, symbol, time, old_target);
                let dead = self.states[state]
                    .interval_mut(symbol, time)
                    .take_target()
                    .expect("the split created a target for the left half");
                self.states.remove(dead);
            } else {
                let target = self.states[state].interval_mut(symbol, time).take_target();
                self.states[state]
                    .interval_mut(symbol, time + 1)
                    .set_target(target);
            }
        }
        self.states[state].partition_mut(symbol).undo_split(time);
    }

    /// Clone the subtree under a freshly split-off interval: move the
    /// successor tails of the interval's tails from the old target into the
    /// interval's new target, then clone or steal the sub-targets.
    fn recurse_split(&mut self, owner: StateId, symbol: usize, key: Time, old_target: StateId) {
        let new_target = self.states[owner]
            .interval(symbol, key)
            .target()
            .expect("recurse_split runs below a freshly targeted interval");
        let tails: Vec<TailId> = self.states[owner]
            .interval(symbol, key)
            .tails()
            .iter()
            .map(|(_, t)| t)
            .collect();
        for tail in tails {
            if let Some(next) = self.sample.next_tail(tail) {
                self.del_tail(old_target, next);
                self.add_tail(new_target, next);
            }
        }

        let max_time = self.params.max_time;
        for symbol in 0..self.params.max_symbol {
            if self.states[new_target].interval(symbol, max_time).is_empty() {
                continue;
            }
            if !self.states[old_target].interval(symbol, max_time).is_empty() {
                let next_old_target = self.states[old_target]
                    .interval(symbol, max_time)
                    .target()
                    .expect("a populated interval always has a target");
                let fresh = self.states.insert(TimedState::new(&self.params));
                self.states[new_target]
                    .interval_mut(symbol, max_time)
                    .set_target(Some(fresh));
                self.recurse_split(new_target, symbol, max_time, next_old_target);
            } else {
                let stolen = self.states[old_target]
                    .interval_mut(symbol, max_time)
                    .take_target();
                self.states[new_target]
                    .interval_mut(symbol, max_time)
                    .set_target(stolen);
            }
        }
    }

    /// Fold a cloned subtree back, in reverse symbol order.
    fn recurse_un_split(&mut self, owner: StateId, symbol: usize, key: Time, old_target: StateId) {
        let new_target = self.states[owner]
            .interval(symbol, key)
            .target()
            .expect("recurse_un_split runs below a targeted interval");
        let max_time = self.params.max_time;
        for symbol in (0..self.params.max_symbol).rev() {
            if self.states[new_target].interval(symbol, max_time).is_empty() {
                continue;
            }
            if !self.states[old_target].interval(symbol, max_time).is_empty() {
                let next_old_target = self.states[old_target]
                    .interval(symbol, max_time)
                    .target()
                    .expect("a populated interval always has a target");
                self.recurse_un_split(new_target, symbol, max_time, next_old_target);
                let dead = self.states[new_target]
                    .interval_mut(symbol, max_time)
                    .take_target()
                    .expect("the split created this sub-target");
                self.states.remove(dead);
            } else {
                let stolen = self.states[new_target]
                    .interval_mut(symbol, max_time)
                    .take_target();
                self.states[old_target]
                    .interval_mut(symbol, max_time)
                    .set_target(stolen);
            }
        }

        for symbol in (0..self.params.max_symbol).rev() {
            let moved = std::mem::take(
                self.states[new_target]
                    .interval_mut(symbol, max_time)
                    .tails_mut(),
            );
            for (time, tail) in moved.iter() {
                let tail_symbol = self.sample.tail_symbol(tail);
                let bar = self.params.bar_of(time);
                self.states[old_target].stats.add_count(tail_symbol, bar);
                self.states[new_target].stats.del_count(tail_symbol, bar);
            }
            self.states[old_target]
                .interval_mut(symbol, max_time)
                .tails_mut()
                .append(moved);
        }
    }

    /// Redirect the interval of `symbol` containing `time` to `new_target`.
    /// A non-null old target makes this a merge: the old subtree is
    /// pre-split so both subtrees share interval boundaries, then fused
    /// into the new target. The old subtree stays in the arena, referenced
    /// by the interval's undo slot.
    pub fn point(&mut self, state: StateId, symbol: usize, time: Time, new_target: StateId) {
        trace!(?state, symbol, time, ?new_target, "point");
        let snapshot = self.states[state].interval(symbol, time).tails().clone();
        let old_target = self.states[state].interval(symbol, time).target();
        assert!(
            old_target != Some(new_target),
            "point requires a changed target"
        );
        {
            let interval = self.states[state].interval_mut(symbol, time);
            interval.set_undo_tails(Some(snapshot));
            interval.set_target(Some(new_target));
        }
        if let Some(old_target) = old_target {
            self.pre_split(old_target, new_target);
            self.recurse_merge(old_target, new_target);
            self.states[state]
                .interval_mut(symbol, time)
                .set_undo_target(Some(old_target));
        }
    }

    /// Exact inverse of [`Self::point`], relying on the saved undo slots.
    pub fn undo_point(&mut self, state: StateId, symbol: usize, time: Time, new_target: StateId) {
        trace!(?state, symbol, time, ?new_target, "undo point");
        assert_eq!(
            self.states[state].interval(symbol, time).target(),
            Some(new_target)
        );
        let old_target = self.states[state].interval_mut(symbol, time).take_undo_target();
        if let Some(old_target) = old_target {
            self.recurse_un_merge(old_target, new_target);
            self.un_pre_split(old_target);
            self.states[state]
                .interval_mut(symbol, time)
                .set_target(Some(old_target));
        }
        let snapshot = self.states[state].interval_mut(symbol, time).take_undo_tails();
        debug_assert_eq!(
            snapshot.as_ref(),
            Some(self.states[state].interval(symbol, time).tails()),
            "rollback must restore the exact tail multiset"
        );
    }

    /// Replicate every interval boundary of `new` inside `old`, then
    /// descend into corresponding sub-targets. On entry the `old` subtree
    /// must be in the tree-initial shape.
    pub(crate) fn pre_split(&mut self, old: StateId, new: StateId) {
        let max_time = self.params.max_time;
        for symbol in 0..self.params.max_symbol {
            assert_eq!(
                self.states[old].partition(symbol).first_end(),
                max_time,
                "pre-split expects an unsplit source partition"
            );
            let boundaries: Vec<Time> = self.states[new]
                .partition(symbol)
                .ends()
                .filter(|&end| end != max_time)
                .collect();
            for end in boundaries {
                self.split(old, symbol, end);
            }
        }
        for symbol in 0..self.params.max_symbol {
            let pairs: Vec<(StateId, StateId)> = {
                let old_partition = self.states[old].partition(symbol);
                let new_partition = self.states[new].partition(symbol);
                old_partition
                    .iter()
                    .zip(new_partition.iter())
                    .filter_map(|(old_interval, new_interval)| {
                        assert_eq!(old_interval.end(), new_interval.end());
                        assert_eq!(old_interval.begin(), new_interval.begin());
                        Some((old_interval.target()?, new_interval.target()?))
                    })
                    .collect()
            };
            for (old_child, new_child) in pairs {
                self.pre_split(old_child, new_child);
            }
        }
    }

    /// Undo every split introduced by [`Self::pre_split`], restoring the
    /// tree-initial shape bottom-up.
    pub(crate) fn un_pre_split(&mut self, old: StateId) {
        for symbol in 0..self.params.max_symbol {
            let children: Vec<StateId> = self.states[old]
                .partition(symbol)
                .iter()
                .filter_map(Interval::target)
                .collect();
            for child in children {
                self.un_pre_split(child);
            }
        }
        let max_time = self.params.max_time;
        for symbol in 0..self.params.max_symbol {
            loop {
                let first_end = self.states[old].partition(symbol).first_end();
                if first_end == max_time {
                    break;
                }
                self.undo_split(old, symbol, first_end);
            }
        }
    }

    /// Fuse the `old` subtree into `new`, walking corresponding intervals
    /// in ascending order. Tails are copied, counts added; sub-targets are
    /// merged recursively or re-hung when `new` has no counterpart.
    fn recurse_merge(&mut self, old: StateId, new: StateId) {
        for symbol in 0..self.params.max_symbol {
            let ends: Vec<Time> = self.states[old].partition(symbol).ends().collect();
            for end in ends {
                {
                    let old_interval = self.states[old].partition(symbol).lookup(end);
                    let new_interval = self.states[new].partition(symbol).lookup(end);
                    assert_eq!(old_interval.end(), new_interval.end());
                    assert_eq!(old_interval.begin(), new_interval.begin());
                }
                if self.states[old].partition(symbol).lookup(end).is_empty() {
                    continue;
                }
                if !self.states[new].partition(symbol).lookup(end).is_empty() {
                    let old_child = self.states[old]
                        .partition(symbol)
                        .lookup(end)
                        .target()
                        .expect("a populated interval always has a target");
                    let new_child = self.states[new]
                        .partition(symbol)
                        .lookup(end)
                        .target()
                        .expect("a populated interval always has a target");
                    self.recurse_merge(old_child, new_child);
                } else {
                    let moved = self.states[old]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .take_target();
                    self.states[new]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .set_target(moved);
                }
                let copied = self.states[old].partition(symbol).lookup(end).tails().clone();
                for (time, tail) in copied.iter() {
                    let tail_symbol = self.sample.tail_symbol(tail);
                    let bar = self.params.bar_of(time);
                    self.states[new].stats.add_count(tail_symbol, bar);
                }
                self.states[new]
                    .partition_mut(symbol)
                    .lookup_mut(end)
                    .tails_mut()
                    .append(copied);
            }
        }
    }

    /// Invert [`Self::recurse_merge`], walking intervals in reverse order
    /// so the insertion pattern unwinds exactly.
    fn recurse_un_merge(&mut self, old: StateId, new: StateId) {
        for symbol in (0..self.params.max_symbol).rev() {
            let ends: Vec<Time> = self.states[old].partition(symbol).ends().collect();
            for end in ends.into_iter().rev() {
                {
                    let old_interval = self.states[old].partition(symbol).lookup(end);
                    let new_interval = self.states[new].partition(symbol).lookup(end);
                    assert_eq!(old_interval.end(), new_interval.end());
                    assert_eq!(old_interval.begin(), new_interval.begin());
                }
                if self.states[old].partition(symbol).lookup(end).is_empty() {
                    continue;
                }
                let tails: Vec<(Time, TailId)> = self.states[old]
                    .partition(symbol)
                    .lookup(end)
                    .tails()
                    .iter()
                    .collect();
                for &(time, tail) in &tails {
                    self.states[new]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .del_tail(time, tail);
                    let tail_symbol = self.sample.tail_symbol(tail);
                    self.states[new]
                        .stats
                        .del_count(tail_symbol, self.params.bar_of(time));
                }
                if !self.states[new].partition(symbol).lookup(end).is_empty() {
                    let old_child = self.states[old]
                        .partition(symbol)
                        .lookup(end)
                        .target()
                        .expect("merged intervals keep their sub-target");
                    let new_child = self.states[new]
                        .partition(symbol)
                        .lookup(end)
                        .target()
                        .expect("a populated interval always has a target");
                    self.recurse_un_merge(old_child, new_child);
                } else {
                    let moved = self.states[new]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .take_target();
                    self.states[old]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .set_target(moved);
                }
            }
        }
    }

    /// Mark a tail and every forward tail reachable through its chain,
    /// moving each observation from the counts to the marks. Idempotent
    /// per tail.
    pub fn mark(&mut self, state: StateId, tail: TailId) {
        let flat = self.sample.flat_index(tail);
        if self.marked.contains(flat) {
            return;
        }
        let (symbol, time, bar) = self.tail_placement(tail);
        self.states[state].stats.mark(symbol, bar);
        self.states[state].interval_mut(symbol, time).add_marked();
        self.marked.insert(flat);
        if let Some(next) = self.sample.next_tail(tail) {
            let target = self.states[state]
                .interval(symbol, time)
                .target()
                .expect("tail chain needs a target");
            self.mark(target, next);
        }
    }

    /// Exact inverse of [`Self::mark`].
    pub fn un_mark(&mut self, state: StateId, tail: TailId) {
        let flat = self.sample.flat_index(tail);
        if !self.marked.contains(flat) {
            return;
        }
        let (symbol, time, bar) = self.tail_placement(tail);
        self.states[state].stats.unmark(symbol, bar);
        self.states[state].interval_mut(symbol, time).del_marked();
        self.marked.remove(flat);
        if let Some(next) = self.sample.next_tail(tail) {
            let target = self.states[state]
                .interval(symbol, time)
                .target()
                .expect("tail chain needs a target");
            self.un_mark(target, next);
        }
    }

    /// Unmark every tail of the interval of `symbol` containing `time`,
    /// including the downstream chains.
    pub fn clear_marked(&mut self, state: StateId, symbol: usize, time: Time) {
        let tails: Vec<TailId> = self.states[state]
            .interval(symbol, time)
            .tails()
            .iter()
            .map(|(_, t)| t)
            .collect();
        for tail in tails {
            self.un_mark(state, tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automaton(corpus: &str) -> Automaton {
        let sample = TimedSample::parse(corpus).unwrap();
        let params = Params::for_sample(&sample, TestType::ChiSquared, 0.05);
        Automaton::new(sample, params)
    }

    #[test]
    fn point_undo_point_is_bit_identical() {
        let mut automaton = automaton("4 2\n2 a 1 a 1\n2 a 1 b 2\n2 b 2 a 1\n2 b 2 b 2\n");
        automaton.check_consistency();
        let before = automaton.render_full();

        let root = automaton.root();
        automaton.point(root, 1, 2, root);
        automaton.check_consistency();
        let merged = automaton.render_full();
        assert_ne!(before, merged);
        // Both subtrees were fused into the root.
        assert_eq!(automaton.state(root).stats.total_counts(), 6);

        automaton.undo_point(root, 1, 2, root);
        automaton.check_consistency();
        assert_eq!(before, automaton.render_full());
    }

    #[test]
    fn split_undo_split_is_bit_identical() {
        let mut automaton = automaton("2 2\n2 a 1 a 1\n2 a 3 b 2\n");
        automaton.check_consistency();
        let before = automaton.render_full();

        let root = automaton.root();
        automaton.split(root, 0, 1);
        automaton.check_consistency();
        let split = automaton.render_full();
        assert_ne!(before, split);
        let left = automaton.state(root).interval(0, 1);
        let right = automaton.state(root).interval(0, 2);
        assert_eq!((left.begin(), left.end()), (0, 1));
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 1);
        assert_ne!(left.target(), right.target());

        automaton.undo_split(root, 0, 1);
        automaton.check_consistency();
        assert_eq!(before, automaton.render_full());
    }

    #[test]
    fn split_propagates_successor_tails() {
        let mut automaton = automaton("2 2\n2 a 1 a 1\n2 a 3 b 2\n");
        let root = automaton.root();
        automaton.split(root, 0, 1);
        let left_target = automaton.state(root).interval(0, 1).target().unwrap();
        let right_target = automaton.state(root).interval(0, 2).target().unwrap();
        // The `a 1` continuation followed its tail to the left subtree, the
        // `b 2` continuation stayed on the right.
        assert_eq!(automaton.state(left_target).stats.symbol_counts(), &[1, 0]);
        assert_eq!(automaton.state(right_target).stats.symbol_counts(), &[0, 1]);
    }

    #[test]
    fn marking_is_idempotent_and_reversible() {
        let mut automaton = automaton("2 1\n2 a 1 a 1\n2 a 3 a 2\n");
        automaton.check_consistency();
        let before = automaton.render_full();
        let root = automaton.root();
        let tail = automaton.sample().first_tail(0).unwrap();

        automaton.mark(root, tail);
        automaton.mark(root, tail);
        // The chain moved one observation per visited state.
        assert_eq!(automaton.state(root).stats.total_marks(), 1);
        assert_eq!(automaton.state(root).interval(0, 1).num_marked(), 1);
        let child = automaton.state(root).interval(0, 1).target().unwrap();
        assert_eq!(automaton.state(child).stats.total_marks(), 1);

        automaton.clear_marked(root, 0, 1);
        automaton.check_consistency();
        assert_eq!(before, automaton.render_full());
    }
}
