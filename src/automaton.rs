use std::fmt::Write as _;

use bit_set::BitSet;
use slotmap::SlotMap;
use tracing::debug;

use rtinfer_core::prelude::*;

use crate::state::TimedState;

/// The mutable hybrid of prefix tree and learned automaton.
///
/// Every state lives in the arena; the ordered `colored` list singles out
/// the states that belong to the learned automaton, root first. Any other
/// state reachable from a colored one is a tree state, owned by the unique
/// interval whose target points at it.
pub struct Automaton {
    pub(crate) params: Params,
    pub(crate) sample: TimedSample,
    pub(crate) states: SlotMap<StateId, TimedState>,
    pub(crate) colored: Vec<StateId>,
    pub(crate) root: StateId,
    /// Marker bits of all tails, indexed by their dense corpus position.
    pub(crate) marked: BitSet,
}

impl Automaton {
    /// Build the initial tree automaton for a corpus: a colored root whose
    /// reachable tree states memorize every timed suffix.
    pub fn new(sample: TimedSample, params: Params) -> Self {
        let mut states = SlotMap::with_key();
        let root = states.insert(TimedState::new(&params));
        let marked = BitSet::with_capacity(sample.total_positions());
        let mut automaton = Self {
            params,
            sample,
            states,
            colored: vec![root],
            root,
            marked,
        };
        for word in 0..automaton.sample.num_words() {
            if let Some(tail) = automaton.sample.first_tail(word) {
                automaton.add_tail(root, tail);
            }
        }
        automaton.create_states(root);
        debug!(
            states = automaton.total_num_states(),
            tails = automaton.sample.total_positions(),
            "built initial tree automaton"
        );
        automaton
    }

    /// Recursively grow the prefix tree: every non-empty interval gets a
    /// fresh tree target holding the successors of its tails.
    fn create_states(&mut self, state: StateId) {
        for symbol in 0..self.params.max_symbol {
            let ends: Vec<Time> = self.states[state].partition(symbol).ends().collect();
            for end in ends {
                let interval = self.states[state].partition(symbol).lookup(end);
                assert!(interval.target().is_none());
                if interval.is_empty() {
                    continue;
                }
                let tails: Vec<TailId> = interval.tails().iter().map(|(_, t)| t).collect();
                let child = self.states.insert(TimedState::new(&self.params));
                self.states[state]
                    .partition_mut(symbol)
                    .lookup_mut(end)
                    .set_target(Some(child));
                for tail in tails {
                    if let Some(next) = self.sample.next_tail(tail) {
                        self.add_tail(child, next);
                    }
                }
                self.create_states(child);
            }
        }
    }

    /// The symbol, delay and histogram bin of a tail.
    pub(crate) fn tail_placement(&self, tail: TailId) -> (usize, Time, usize) {
        let symbol = self.sample.tail_symbol(tail);
        let time = self.sample.tail_time(tail);
        (symbol, time, self.params.bar_of(time))
    }

    /// Place a tail into the state's interval for its symbol and delay.
    pub fn add_tail(&mut self, state: StateId, tail: TailId) {
        let (symbol, time, bar) = self.tail_placement(tail);
        self.states[state].add_tail(symbol, time, bar, tail);
    }

    /// Remove a tail from the state's interval for its symbol and delay.
    pub fn del_tail(&mut self, state: StateId, tail: TailId) {
        let (symbol, time, bar) = self.tail_placement(tail);
        self.states[state].del_tail(symbol, time, bar, tail);
    }

    /// The learning parameters in effect.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The corpus the automaton was built from.
    pub fn sample(&self) -> &TimedSample {
        &self.sample
    }

    /// The root state, colored at creation.
    pub fn root(&self) -> StateId {
        self.root
    }

    /// The colored states in order, root first.
    pub fn colored(&self) -> &[StateId] {
        &self.colored
    }

    /// Number of colored states.
    pub fn num_states(&self) -> usize {
        self.colored.len()
    }

    /// Shared access to a state.
    pub fn state(&self, id: StateId) -> &TimedState {
        &self.states[id]
    }

    /// Mutable access to a state.
    pub fn state_mut(&mut self, id: StateId) -> &mut TimedState {
        &mut self.states[id]
    }

    /// Append a state to the colored list.
    pub fn add_state(&mut self, state: StateId) {
        self.colored.push(state);
    }

    /// Remove a state from the colored list, scanning from the back.
    pub fn del_state(&mut self, state: StateId) {
        if let Some(pos) = self.colored.iter().rposition(|&s| s == state) {
            self.colored.remove(pos);
        }
    }

    /// Whether a state is colored. This is the authoritative test that
    /// separates automaton states from tree states.
    pub fn contains_state(&self, state: StateId) -> bool {
        self.colored.contains(&state)
    }

    /// The colored state with the given number.
    pub fn get_state(&self, number: usize) -> Option<StateId> {
        self.colored.get(number).copied()
    }

    /// The number of a colored state.
    pub fn number_of(&self, state: StateId) -> Option<usize> {
        self.colored.iter().position(|&s| s == state)
    }

    /// Whether the tail's marker bit is set.
    pub fn is_marked(&self, tail: TailId) -> bool {
        self.marked.contains(self.sample.flat_index(tail))
    }

    /// Number of transitions of the learned automaton: intervals of a
    /// colored state pointing at the same target in sequence collapse into
    /// one transition.
    pub fn transition_count(&self) -> usize {
        let mut result = 0;
        for &state in &self.colored {
            for symbol in 0..self.params.max_symbol {
                let mut prev: Option<Option<StateId>> = None;
                for interval in self.states[state].partition(symbol).iter() {
                    if prev == Some(interval.target()) {
                        continue;
                    }
                    result += 1;
                    prev = Some(interval.target());
                }
            }
        }
        result
    }

    /// Number of colored states plus all tree states reachable from them.
    pub fn total_num_states(&self) -> usize {
        let mut result = 0;
        for &state in &self.colored {
            result += 1;
            for symbol in 0..self.params.max_symbol {
                for interval in self.states[state].partition(symbol).iter() {
                    let Some(target) = interval.target() else {
                        continue;
                    };
                    if self.contains_state(target) {
                        continue;
                    }
                    result += self.recursive_num_states(target);
                }
            }
        }
        result
    }

    fn recursive_num_states(&self, state: StateId) -> usize {
        let mut result = 1;
        for symbol in 0..self.params.max_symbol {
            for interval in self.states[state].partition(symbol).iter() {
                match interval.target() {
                    None => continue,
                    Some(target) if target == state => continue,
                    Some(target) => result += self.recursive_num_states(target),
                }
            }
        }
        result
    }

    /// Point every root transition at the root itself, folding the whole
    /// tree into a universal one-state automaton.
    pub fn garbage_automaton(&mut self) {
        let root = self.colored[0];
        for symbol in 0..self.params.max_symbol {
            self.point(root, symbol, 0, root);
        }
    }

    /// Color every reachable tree state and route dangling transitions to a
    /// fresh garbage sink.
    pub fn tree_automaton(&mut self) {
        let garbage = self.states.insert(TimedState::new(&self.params));
        for symbol in 0..self.params.max_symbol {
            self.point(garbage, symbol, 0, garbage);
        }

        let mut i = 0;
        while i < self.colored.len() {
            let state = self.colored[i];
            i += 1;
            for symbol in 0..self.params.max_symbol {
                let ends: Vec<Time> = self.states[state].partition(symbol).ends().collect();
                for end in ends {
                    let interval = self.states[state].partition(symbol).lookup(end);
                    match interval.target() {
                        None => {
                            self.states[state]
                                .partition_mut(symbol)
                                .lookup_mut(end)
                                .set_target(Some(garbage));
                        }
                        Some(target) => {
                            if self.contains_state(target) || interval.is_empty() {
                                continue;
                            }
                            self.recursive_tree_automaton(target, garbage);
                        }
                    }
                }
            }
        }
        self.add_state(garbage);
    }

    fn recursive_tree_automaton(&mut self, state: StateId, garbage: StateId) {
        self.add_state(state);
        for symbol in 0..self.params.max_symbol {
            let ends: Vec<Time> = self.states[state].partition(symbol).ends().collect();
            for end in ends {
                let interval = self.states[state].partition(symbol).lookup(end);
                if interval.target().is_none() {
                    self.states[state]
                        .partition_mut(symbol)
                        .lookup_mut(end)
                        .set_target(Some(garbage));
                }
                let interval = self.states[state].partition(symbol).lookup(end);
                if interval.is_empty() {
                    continue;
                }
                let target = interval.target().expect("just routed");
                if target != garbage {
                    self.recursive_tree_automaton(target, garbage);
                }
            }
        }
    }

    /// Load a previously saved automaton over the freshly built tree.
    /// Reading stops at the first line that does not match the saved
    /// format; transitions to unknown states are routed to a garbage sink.
    pub fn read_saved(&mut self, input: &str) {
        assert_eq!(self.colored.len(), 1, "read_saved expects a fresh tree");
        for symbol in 0..self.params.max_symbol {
            let target = self.states[self.root].target(symbol, 1);
            assert!(target.map_or(true, |t| self.number_of(t).is_none()));
        }

        let garbage = self.states.insert(TimedState::new(&self.params));
        for symbol in 0..self.params.max_symbol {
            self.point(garbage, symbol, 0, garbage);
        }

        for line in input.lines() {
            let Some((source, symbol_char, begin, end, target, _count, _prob)) =
                parse_saved_line(line)
            else {
                break;
            };
            let Some(symbol) = self.sample.alphabet().index(symbol_char) else {
                continue;
            };
            while self.get_state(source).is_none() {
                let fresh = self.states.insert(TimedState::new(&self.params));
                self.add_state(fresh);
            }
            let state = self.get_state(source).expect("just added");
            if let Some(number) = target {
                while self.get_state(number).is_none() {
                    let fresh = self.states.insert(TimedState::new(&self.params));
                    self.add_state(fresh);
                }
            }
            let target = target
                .and_then(|number| self.get_state(number))
                .unwrap_or(garbage);

            if begin > self.params.max_time as i64 {
                continue;
            }
            let begin = begin as Time;
            let end = (end as Time).min(self.params.max_time);

            if self.states[state].interval(symbol, begin).begin() != begin {
                self.split(state, symbol, begin - 1);
            }
            if self.states[state].interval(symbol, begin).end() != end {
                self.split(state, symbol, end);
            }
            let interval = self.states[state].interval(symbol, begin);
            assert_eq!(interval.begin(), begin);
            assert_eq!(interval.end(), end);

            self.point(state, symbol, begin, target);
            assert_eq!(self.states[state].target(symbol, begin), Some(target));
        }

        let mut i = 0;
        while i < self.colored.len() {
            let state = self.colored[i];
            i += 1;
            for symbol in 0..self.params.max_symbol {
                let ends: Vec<Time> = self.states[state].partition(symbol).ends().collect();
                for end in ends {
                    let interval = self.states[state].partition(symbol).lookup(end);
                    let target = interval.target();
                    let unnumbered = target.map_or(true, |t| self.number_of(t).is_none());
                    if unnumbered && target != Some(garbage) {
                        let begin = interval.begin();
                        self.point(state, symbol, begin, garbage);
                    }
                }
            }
        }
        self.add_state(garbage);
    }

    /// The SOLUTION text block: one line per transition of each colored
    /// state, adjacent intervals with the same target merged, empty
    /// intervals omitted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for &state in &self.colored {
            self.render_state(&mut out, state);
        }
        out
    }

    fn render_state(&self, out: &mut String, state: StateId) {
        let number = self.number_of(state).expect("rendered states are colored");
        let total_size: usize = (0..self.params.max_symbol)
            .flat_map(|s| self.states[state].partition(s).iter())
            .map(Interval::len)
            .sum();
        for symbol in 0..self.params.max_symbol {
            let intervals: Vec<&Interval> = self.states[state].partition(symbol).iter().collect();
            let mut group_start = 0;
            let mut group_end: Time = 0;
            let mut group_size = 0;
            for (i, interval) in intervals.iter().enumerate() {
                if interval.len() == 0 {
                    continue;
                }
                if intervals[group_start].target() != interval.target() {
                    if group_size != 0 {
                        self.render_transition(
                            out,
                            number,
                            symbol,
                            intervals[group_start],
                            group_end,
                            group_size,
                            total_size,
                        );
                    }
                    group_start = i;
                    group_end = interval.end();
                    group_size = interval.len();
                } else {
                    group_size += interval.len();
                    group_end = interval.end();
                }
            }
            if group_size != 0 {
                self.render_transition(
                    out,
                    number,
                    symbol,
                    intervals[group_start],
                    group_end,
                    group_size,
                    total_size,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_transition(
        &self,
        out: &mut String,
        number: usize,
        symbol: usize,
        first: &Interval,
        end: Time,
        size: usize,
        total_size: usize,
    ) {
        let symbol_char = self.sample.alphabet().symbol(symbol).unwrap_or('\0');
        let target = first
            .target()
            .and_then(|t| self.number_of(t))
            .map_or(-1, |n| n as i64);
        let probability = size as f64 / total_size as f64;
        writeln!(
            out,
            "{number} {symbol_char} [{}, {end}]->{target} #{size} p={probability}",
            first.begin()
        )
        .expect("writing to a string cannot fail");
    }

    /// Deep diagnostic dump of the full structure: every colored state and
    /// every reachable tree subtree with interval boundaries, tail buckets
    /// and statistics counters. Two automata in the same abstract state
    /// render identically, which is what the apply/undo laws assert.
    pub fn render_full(&self) -> String {
        let mut out = String::new();
        for (i, &state) in self.colored.iter().enumerate() {
            self.render_full_state(&mut out, &i.to_string(), state);
        }
        out
    }

    fn render_full_state(&self, out: &mut String, label: &str, state: StateId) {
        let stats = &self.states[state].stats;
        writeln!(
            out,
            "{label} syms={:?} times={:?} total={} marks={}",
            stats.symbol_counts(),
            stats.time_counts(),
            stats.total_counts(),
            stats.total_marks()
        )
        .expect("writing to a string cannot fail");
        for symbol in 0..self.params.max_symbol {
            for interval in self.states[state].partition(symbol).iter() {
                let target = match interval.target() {
                    Some(t) if self.contains_state(t) => {
                        self.number_of(t).expect("colored").to_string()
                    }
                    Some(_) => "tree".to_string(),
                    None => "-".to_string(),
                };
                let tails: Vec<String> = interval
                    .tails()
                    .iter()
                    .map(|(time, tail)| format!("{time}:{}.{}", tail.word, tail.index))
                    .collect();
                writeln!(
                    out,
                    "{label} {symbol} [{}, {}]->{target} marked={} tails=[{}]",
                    interval.begin(),
                    interval.end(),
                    interval.num_marked(),
                    tails.join(" ")
                )
                .expect("writing to a string cannot fail");
            }
        }
        for symbol in 0..self.params.max_symbol {
            for interval in self.states[state].partition(symbol).iter() {
                if let Some(target) = interval.target() {
                    if !self.contains_state(target) {
                        let child_label =
                            format!("{label}.{symbol}[{},{}]", interval.begin(), interval.end());
                        self.render_full_state(out, &child_label, target);
                    }
                }
            }
        }
    }

    /// Audit every structural invariant of the hybrid automaton. Debug
    /// builds abort on the first violation; release builds do nothing.
    pub fn check_consistency(&self) {
        #[cfg(debug_assertions)]
        self.check_consistency_impl();
    }

    #[cfg(debug_assertions)]
    fn check_consistency_impl(&self) {
        for (_, state) in &self.states {
            let stats = &state.stats;
            let mut tails = 0i64;
            let mut per_symbol = 0i64;
            for symbol in 0..self.params.max_symbol {
                per_symbol += stats.symbol_count(symbol);
                for interval in state.partition(symbol).iter() {
                    tails += interval.len() as i64;
                }
            }
            let per_bar: i64 = stats.time_counts().iter().sum();
            // Marked tails stay in their buckets but move out of the counts.
            assert_eq!(stats.total_counts() + stats.total_marks(), tails);
            assert_eq!(stats.total_counts(), per_symbol);
            assert_eq!(stats.total_counts(), per_bar);
        }

        for &state in &self.colored {
            assert_eq!(self.states[state].stats.total_marks(), 0);
            for symbol in 0..self.params.max_symbol {
                for interval in self.states[state].partition(symbol).iter() {
                    assert_eq!(interval.num_marked(), 0);
                    for (time, tail) in interval.tails().iter() {
                        assert!(interval.begin() <= time && time <= interval.end());
                        assert!(!self.is_marked(tail));
                        if self.sample.next_tail(tail).is_some() {
                            let target = interval.target().expect("tail chain needs a target");
                            self.check_next_tail(target, self.sample.next_tail(tail).unwrap());
                        }
                    }
                }
            }
        }
    }

    /// Follow one tail chain downstream, checking placement at every hop
    /// while the owning states are tree states.
    #[cfg(debug_assertions)]
    fn check_next_tail(&self, owner: StateId, tail: TailId) {
        let (symbol, time, _) = self.tail_placement(tail);
        let interval = self.states[owner].interval(symbol, time);
        assert!(interval.begin() <= time && time <= interval.end());
        assert!(interval.contains_tail(time, tail));
        assert!(!self.is_marked(tail));
        let Some(next) = self.sample.next_tail(tail) else {
            return;
        };
        let target = interval.target().expect("tail chain needs a target");
        let (next_symbol, next_time, _) = self.tail_placement(next);
        let next_interval = self.states[target].interval(next_symbol, next_time);
        assert!(next_interval.contains_tail(next_time, next));
        assert!(next_interval.begin() <= next_time && next_time <= next_interval.end());
        if !self.contains_state(target) {
            assert_eq!(self.states[target].stats.total_marks(), 0);
            assert_eq!(next_interval.begin(), self.params.min_time);
            assert_eq!(next_interval.end(), self.params.max_time);
            self.check_next_tail(target, next);
        }
    }
}

/// Parse one saved-automaton line of the form
/// `state sym [begin, end]->target #count p=prob`. A target of `-1` maps to
/// `None`. Returns `None` for any line that does not match.
fn parse_saved_line(line: &str) -> Option<(usize, char, i64, i64, Option<usize>, i64, f64)> {
    let mut tokens = line.split_whitespace();
    let source: usize = tokens.next()?.parse().ok()?;
    let symbol_token = tokens.next()?;
    let mut chars = symbol_token.chars();
    let symbol = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    let begin: i64 = tokens.next()?.strip_prefix('[')?.strip_suffix(',')?.parse().ok()?;
    let (end_token, target_token) = tokens.next()?.split_once("]->")?;
    let end: i64 = end_token.parse().ok()?;
    let target: i64 = target_token.parse().ok()?;
    let count: i64 = tokens.next()?.strip_prefix('#')?.parse().ok()?;
    let probability: f64 = tokens.next()?.strip_prefix("p=")?.parse().ok()?;
    if tokens.next().is_some() {
        return None;
    }
    let target = (target >= 0).then_some(target as usize);
    Some((source, symbol, begin, end, target, count, probability))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TimedSample {
        TimedSample::parse("2 2\n2 a 3 b 1\n2 a 5 b 2\n").unwrap()
    }

    fn automaton() -> Automaton {
        let sample = sample();
        let params = Params::for_sample(&sample, TestType::ChiSquared, 0.05);
        Automaton::new(sample, params)
    }

    #[test]
    fn prefix_tree_construction() {
        let automaton = automaton();
        automaton.check_consistency();
        assert_eq!(automaton.num_states(), 1);
        // Both words share the root `a` interval, so the tree is root, one
        // `a` child holding the two `b` tails, and one empty leaf.
        assert_eq!(automaton.total_num_states(), 3);
        let root = automaton.root();
        let root_interval = automaton.state(root).interval(0, 3);
        assert_eq!(root_interval.len(), 2);
        let child = root_interval.target().unwrap();
        assert!(!automaton.contains_state(child));
        assert_eq!(automaton.state(child).stats.total_counts(), 2);
        assert_eq!(automaton.state(child).stats.symbol_counts(), &[0, 2]);
    }

    #[test]
    fn registry_scans() {
        let mut automaton = automaton();
        let root = automaton.root();
        let child = automaton.state(root).target(0, 3).unwrap();
        assert!(!automaton.contains_state(child));
        assert_eq!(automaton.number_of(child), None);
        automaton.add_state(child);
        assert!(automaton.contains_state(child));
        assert_eq!(automaton.number_of(child), Some(1));
        assert_eq!(automaton.get_state(1), Some(child));
        automaton.del_state(child);
        assert!(!automaton.contains_state(child));
    }

    #[test]
    fn transition_count_collapses_equal_targets() {
        let automaton = automaton();
        // One interval per symbol on the root: two transitions.
        assert_eq!(automaton.transition_count(), 2);
    }

    #[test]
    fn render_merges_adjacent_groups() {
        let automaton = automaton();
        let rendered = automaton.render();
        assert_eq!(rendered, "0 a [0, 5]->-1 #2 p=1\n");
    }

    #[test]
    fn garbage_automaton_folds_the_tree_into_the_root() {
        let mut automaton = automaton();
        automaton.garbage_automaton();
        automaton.check_consistency();
        let root = automaton.root();
        assert_eq!(automaton.state(root).target(0, 0), Some(root));
        assert_eq!(automaton.state(root).target(1, 0), Some(root));
        assert_eq!(automaton.total_num_states(), 1);
        assert_eq!(automaton.state(root).stats.total_counts(), 4);
    }

    #[test]
    fn tree_automaton_colors_everything() {
        let mut automaton = automaton();
        automaton.tree_automaton();
        automaton.check_consistency();
        // Root, the two tree states and the garbage sink.
        assert_eq!(automaton.num_states(), 4);
        assert_eq!(automaton.total_num_states(), 4);
        let garbage = automaton.get_state(3).unwrap();
        assert_eq!(automaton.state(garbage).target(0, 0), Some(garbage));
        // The root's unused `b` axis falls through to the sink.
        assert_eq!(automaton.state(automaton.root()).target(1, 0), Some(garbage));
    }

    #[test]
    fn saved_line_parsing() {
        assert_eq!(
            parse_saved_line("0 a [0, 5]->1 #20 p=0.5"),
            Some((0, 'a', 0, 5, Some(1), 20, 0.5))
        );
        assert_eq!(
            parse_saved_line("3 b [2, 9]->-1 #7 p=1"),
            Some((3, 'b', 2, 9, None, 7, 1.0))
        );
        assert_eq!(parse_saved_line("SOLUTION:"), None);
        assert_eq!(parse_saved_line("0 a [0, 5]->1"), None);
    }
}
