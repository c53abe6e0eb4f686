//! Candidate enumeration, AIC scoring and the greedy / best-first search
//! over refinement sequences.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use itertools::Itertools;
use tracing::{debug, info, trace};

use rtinfer_core::prelude::*;

use crate::automaton::Automaton;

/// What a refinement does to the automaton.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefinementKind {
    /// Merge: redirect the interval to the colored state with this number.
    Point {
        /// Number of the colored target state.
        target: usize,
    },
    /// Subdivide the interval at the carried time.
    Split,
    /// Promote the interval's tree target into the colored list.
    Color,
}

/// One atomic learning step, identified positionally so it can be replayed
/// on an automaton that has been rewound to the same point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Refinement {
    /// Number of the colored source state.
    pub state: usize,
    /// What to do.
    pub kind: RefinementKind,
    /// The symbol whose partition is refined.
    pub symbol: usize,
    /// The time value identifying the interval (or the split point).
    pub time: Time,
}

impl Refinement {
    /// Apply the refinement to the automaton.
    pub fn apply(&self, automaton: &mut Automaton) {
        let state = automaton
            .get_state(self.state)
            .expect("refinement references a colored state");
        match self.kind {
            RefinementKind::Point { target } => {
                let target = automaton
                    .get_state(target)
                    .expect("refinement references a colored target");
                automaton.point(state, self.symbol, self.time, target);
            }
            RefinementKind::Split => automaton.split(state, self.symbol, self.time),
            RefinementKind::Color => {
                let tree = automaton
                    .state(state)
                    .target(self.symbol, self.time)
                    .expect("color promotes an existing tree state");
                automaton.add_state(tree);
            }
        }
    }

    /// Invert the refinement.
    pub fn undo(&self, automaton: &mut Automaton) {
        let state = automaton
            .get_state(self.state)
            .expect("refinement references a colored state");
        match self.kind {
            RefinementKind::Point { target } => {
                let target = automaton
                    .get_state(target)
                    .expect("refinement references a colored target");
                automaton.undo_point(state, self.symbol, self.time, target);
            }
            RefinementKind::Split => automaton.undo_split(state, self.symbol, self.time),
            RefinementKind::Color => {
                let tree = automaton
                    .state(state)
                    .target(self.symbol, self.time)
                    .expect("color promoted an existing tree state");
                automaton.del_state(tree);
            }
        }
    }
}

impl fmt::Display for Refinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RefinementKind::Point { target } => write!(
                f,
                "point( {} [{}, {}]->{} )",
                self.state, self.symbol, self.time, target
            ),
            RefinementKind::Split => {
                write!(f, "split( {} [{}, {}] )", self.state, self.symbol, self.time)
            }
            RefinementKind::Color => {
                write!(f, "new( {} [{}, {}]-> new )", self.state, self.symbol, self.time)
            }
        }
    }
}

/// A queued refinement sequence, ordered so the heap pops the lowest AIC
/// rollout score first.
struct SearchNode {
    score: f64,
    sequence: Vec<Refinement>,
}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for SearchNode {}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        other.score.total_cmp(&self.score)
    }
}

/// The search driver: owns the automaton, records the best solution found,
/// and explores refinement sequences greedily or best-first.
pub struct Searcher {
    automaton: Automaton,
    best_solution: Option<f64>,
    nodes: u64,
    current: Vec<Refinement>,
    queue: BinaryHeap<SearchNode>,
    max_points_to_search: usize,
    max_splits_to_search: usize,
    solutions: Vec<(f64, String)>,
}

impl Searcher {
    /// A fresh searcher over the given automaton.
    pub fn new(automaton: Automaton) -> Self {
        Self {
            automaton,
            best_solution: None,
            nodes: 0,
            current: Vec::new(),
            queue: BinaryHeap::new(),
            max_points_to_search: 10,
            max_splits_to_search: 10,
            solutions: Vec::new(),
        }
    }

    /// The automaton in its current search position.
    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    /// The AIC of the best solution found so far.
    pub fn best_solution(&self) -> Option<f64> {
        self.best_solution
    }

    /// Number of search nodes expanded.
    pub fn nodes(&self) -> u64 {
        self.nodes
    }

    /// Every strictly improving solution, as (AIC, rendered block) pairs in
    /// the order they were found.
    pub fn solutions(&self) -> &[(f64, String)] {
        &self.solutions
    }

    /// Number of model parameters: one free histogram bin short of all bins
    /// per colored state, plus one per distinct transition.
    pub fn calculate_parameters(&self) -> i64 {
        let bars = self.automaton.params().num_histogram_bars as i64;
        (bars - 1) * self.automaton.num_states() as i64 + self.automaton.transition_count() as i64
    }

    /// AIC of the current automaton over the corpus. Timed symbols not
    /// parsed by a colored state (tails living in tree intervals) carry a
    /// default likelihood of one over the number of histogram bins plus
    /// alphabet symbols.
    pub fn calculate_aic(&self) -> f64 {
        let params = *self.automaton.params();
        let default_log = (1.0 / (params.num_histogram_bars + params.max_symbol) as f64).ln();
        let mut result = 0.0;
        for &state in self.automaton.colored() {
            let stats = &self.automaton.state(state).stats;
            let total = stats.total_counts() as f64;
            for symbol in 0..params.max_symbol {
                // A zero count skips the log term; this also keeps colored
                // states without any observation from poisoning the sum.
                if stats.symbol_count(symbol) != 0 {
                    let symbol_prob = stats.symbol_count(symbol) as f64 / total;
                    result += symbol_prob.ln() * stats.symbol_count(symbol) as f64;
                }
                for interval in self.automaton.state(state).partition(symbol).iter() {
                    let colored = interval
                        .target()
                        .is_some_and(|t| self.automaton.contains_state(t));
                    if colored || interval.is_empty() {
                        continue;
                    }
                    for (_, tail) in interval.tails().iter() {
                        if self.automaton.sample().next_tail(tail).is_some() {
                            let unparsed = self.automaton.sample().suffix_len(tail) as f64 - 1.0;
                            result += default_log * unparsed;
                        }
                    }
                }
            }
            for bar in 0..params.num_histogram_bars {
                if stats.time_count(bar) != 0 {
                    let time_prob = stats.time_count(bar) as f64 / total;
                    result += time_prob.ln() * stats.time_count(bar) as f64;
                }
            }
        }
        2.0 * self.calculate_parameters() as f64 - 2.0 * result
    }

    /// AIC without the default-likelihood term for unparsed tails, used for
    /// pruning inside the best-first search.
    pub fn calculate_aic_without_default(&self) -> f64 {
        let params = *self.automaton.params();
        let mut result = 0.0;
        for &state in self.automaton.colored() {
            let stats = &self.automaton.state(state).stats;
            let total = stats.total_counts() as f64;
            for symbol in 0..params.max_symbol {
                if stats.symbol_count(symbol) != 0 {
                    let symbol_prob = stats.symbol_count(symbol) as f64 / total;
                    result += symbol_prob.ln() * stats.symbol_count(symbol) as f64;
                }
            }
            for bar in 0..params.num_histogram_bars {
                if stats.time_count(bar) != 0 {
                    let time_prob = stats.time_count(bar) as f64 / total;
                    result += time_prob.ln() * stats.time_count(bar) as f64;
                }
            }
        }
        2.0 * self.calculate_parameters() as f64 - 2.0 * result
    }

    /// Enumerate and score the refinements of the single largest uncolored
    /// interval. Returns the merge set (always holding the synthetic color
    /// fallback when a candidate exists) and the split set, both ordered by
    /// p-value descending.
    #[allow(clippy::type_complexity)]
    pub fn best_refinements(&mut self) -> (Vec<(f64, Refinement)>, Vec<(f64, Refinement)>) {
        self.automaton.check_consistency();
        let mut merges = Vec::new();
        let mut splits = Vec::new();
        let params = *self.automaton.params();

        // The uncolored interval with the most tails; first encountered
        // wins ties.
        let mut candidate: Option<(usize, usize, Time, usize)> = None;
        for (number, &state) in self.automaton.colored().iter().enumerate() {
            for symbol in 0..params.max_symbol {
                for interval in self.automaton.state(state).partition(symbol).iter() {
                    let colored = interval
                        .target()
                        .is_some_and(|t| self.automaton.contains_state(t));
                    if colored || interval.is_empty() {
                        continue;
                    }
                    if candidate.is_none_or(|(.., size)| interval.len() > size) {
                        candidate = Some((number, symbol, interval.end(), interval.len()));
                    }
                }
            }
        }
        let Some((state, symbol, end, size)) = candidate else {
            return (merges, splits);
        };
        if (size as i64) < 2 * params.min_data {
            return (merges, splits);
        }
        trace!(state, symbol, end, size, "scoring candidate interval");

        let source = self.automaton.get_state(state).expect("colored");
        for number in 0..self.automaton.num_states() {
            let target = self.automaton.get_state(number).expect("in range");
            if target == self.automaton.root() {
                continue;
            }
            let score = self.automaton.test_point(source, symbol, end, target);
            if score != -1.0 {
                merges.push((
                    score,
                    Refinement {
                        state,
                        kind: RefinementKind::Point { target: number },
                        symbol,
                        time: end,
                    },
                ));
            }
        }
        self.automaton.check_consistency();

        merges.push((
            params.significance,
            Refinement {
                state,
                kind: RefinementKind::Color,
                symbol,
                time: end,
            },
        ));

        // Probe a split at every distinct tail time except the largest.
        let times: Vec<Time> = self
            .automaton
            .state(source)
            .interval(symbol, end)
            .tails()
            .times()
            .collect();
        for (time, _) in times.iter().copied().tuple_windows() {
            let score = self.automaton.test_split(source, symbol, time);
            if score != -1.0 {
                splits.push((
                    score,
                    Refinement {
                        state,
                        kind: RefinementKind::Split,
                        symbol,
                        time,
                    },
                ));
            }
        }
        self.automaton.clear_marked(source, symbol, end);
        self.automaton.check_consistency();

        merges.sort_by(|a, b| b.0.total_cmp(&a.0));
        splits.sort_by(|a, b| b.0.total_cmp(&a.0));
        (merges, splits)
    }

    /// The greedy policy: the most significant split if it beats the
    /// threshold, otherwise the best merge (the color fallback at worst).
    fn pick_refinement(
        merges: &[(f64, Refinement)],
        splits: &[(f64, Refinement)],
        significance: f64,
    ) -> Refinement {
        if let Some(&(p_value, refinement)) = splits.last() {
            if p_value < significance {
                return refinement;
            }
        }
        merges
            .first()
            .expect("the merge set holds at least the color fallback")
            .1
    }

    /// Depth-first greedy rollout: keep applying the locally best
    /// refinement, record the AIC when no refinement is left, then undo
    /// everything on the way back. Returns the AIC of the reached leaf.
    pub fn greedy(&mut self) -> f64 {
        self.nodes += 1;
        let (merges, splits) = self.best_refinements();

        if merges.is_empty() && splits.is_empty() {
            let aic = self.calculate_aic();
            if self.best_solution.is_none_or(|best| aic < best) {
                let rendered = self.automaton.render();
                info!(aic, "improved solution");
                println!("SOLUTION:\n{rendered}SCORE = {aic}");
                self.solutions.push((aic, rendered));
                self.best_solution = Some(aic);
            }
            return aic;
        }

        self.automaton.check_consistency();
        let chosen =
            Self::pick_refinement(&merges, &splits, self.automaton.params().significance);
        debug!(%chosen, "greedy step");
        chosen.apply(&mut self.automaton);
        self.automaton.check_consistency();

        let result = self.greedy();

        chosen.undo(&mut self.automaton);
        self.automaton.check_consistency();
        result
    }

    /// Filter the scored refinement sets down to the candidates a
    /// best-first node expands: up to `max_splits_to_search` of the most
    /// significant splits below the threshold, or, if none qualify, up to
    /// `max_points_to_search` merges at or above it.
    fn select_candidates(
        &self,
        merges: &[(f64, Refinement)],
        splits: &[(f64, Refinement)],
    ) -> Vec<(f64, Refinement)> {
        let significance = self.automaton.params().significance;
        let mut selected = Vec::new();
        for (i, &(p_value, refinement)) in splits.iter().rev().enumerate() {
            if p_value < significance {
                selected.push((p_value, refinement));
            }
            if i + 1 == self.max_splits_to_search {
                break;
            }
        }
        if selected.is_empty() {
            for (i, &(p_value, refinement)) in merges.iter().enumerate() {
                if p_value >= significance {
                    selected.push((p_value, refinement));
                }
                if i + 1 == self.max_points_to_search {
                    break;
                }
            }
        }
        selected.sort_by(|a, b| b.0.total_cmp(&a.0));
        selected
    }

    /// Apply each candidate, score it with a full greedy rollout, undo it,
    /// and queue the extended sequence under the rollout score.
    fn expand(&mut self, candidates: Vec<(f64, Refinement)>) {
        for (_, refinement) in candidates {
            self.automaton.check_consistency();
            refinement.apply(&mut self.automaton);
            let score = self.greedy();
            refinement.undo(&mut self.automaton);

            let mut sequence = self.current.clone();
            sequence.push(refinement);
            self.queue.push(SearchNode { score, sequence });
        }
    }

    /// Transactionally navigate the automaton to another refinement
    /// sequence: undo the current one back to front, then apply the target
    /// front to back.
    fn switch_to(&mut self, sequence: Vec<Refinement>) {
        let current = std::mem::take(&mut self.current);
        for refinement in current.iter().rev() {
            refinement.undo(&mut self.automaton);
        }
        for refinement in &sequence {
            refinement.apply(&mut self.automaton);
        }
        self.current = sequence;
        self.automaton.check_consistency();
    }

    /// Best-first search over refinement sequences keyed by their greedy
    /// AIC lookahead; prunes nodes that already score worse than the best
    /// solution.
    pub fn best_first(&mut self) {
        self.current.clear();
        let (merges, splits) = self.best_refinements();
        let seeds = self.select_candidates(&merges, &splits);
        self.expand(seeds);

        while let Some(SearchNode { score, sequence }) = self.queue.pop() {
            self.nodes += 1;
            trace!(score, depth = sequence.len(), "visiting queued sequence");
            self.switch_to(sequence);

            let aic = self.calculate_aic_without_default();
            if self.best_solution.is_some_and(|best| aic > best) {
                continue;
            }

            let (merges, splits) = self.best_refinements();
            let candidates = self.select_candidates(&merges, &splits);
            if candidates.is_empty() {
                continue;
            }
            self.expand(candidates);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refinement(kind: RefinementKind, time: Time) -> Refinement {
        Refinement {
            state: 0,
            kind,
            symbol: 0,
            time,
        }
    }

    #[test]
    fn greedy_prefers_significant_splits() {
        let color = refinement(RefinementKind::Color, 5);
        let split = refinement(RefinementKind::Split, 3);
        let merges = vec![(0.05, color)];
        let splits = vec![(0.9, refinement(RefinementKind::Split, 7)), (0.001, split)];
        assert_eq!(Searcher::pick_refinement(&merges, &splits, 0.05), split);
        // Without a significant split the best merge wins.
        let splits = vec![(0.9, refinement(RefinementKind::Split, 7))];
        assert_eq!(Searcher::pick_refinement(&merges, &splits, 0.05), color);
        assert_eq!(Searcher::pick_refinement(&merges, &[], 0.05), color);
    }

    #[test]
    fn search_nodes_pop_lowest_score_first() {
        let mut queue = BinaryHeap::new();
        for score in [3.0, 1.0, 2.0] {
            queue.push(SearchNode {
                score,
                sequence: Vec::new(),
            });
        }
        assert_eq!(queue.pop().unwrap().score, 1.0);
        assert_eq!(queue.pop().unwrap().score, 2.0);
        assert_eq!(queue.pop().unwrap().score, 3.0);
    }

    #[test]
    fn refinement_display() {
        assert_eq!(
            refinement(RefinementKind::Point { target: 2 }, 4).to_string(),
            "point( 0 [0, 4]->2 )"
        );
        assert_eq!(
            refinement(RefinementKind::Split, 4).to_string(),
            "split( 0 [0, 4] )"
        );
        assert_eq!(
            refinement(RefinementKind::Color, 4).to_string(),
            "new( 0 [0, 4]-> new )"
        );
    }
}
