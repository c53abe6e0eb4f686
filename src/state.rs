use rtinfer_core::prelude::*;

/// A state of the hybrid prefix-tree/automaton: one interval partition per
/// alphabet symbol plus the occurrence statistics of the tails stored in
/// those partitions.
#[derive(Clone, Debug)]
pub struct TimedState {
    partitions: Vec<IntervalPartition>,
    /// The symbol and time-bin counters the refinement tests compare.
    pub stats: StateStatistics,
}

impl TimedState {
    /// A fresh state in the tree-initial shape: a single interval covering
    /// the whole time axis for every symbol.
    pub fn new(params: &Params) -> Self {
        Self {
            partitions: (0..params.max_symbol)
                .map(|_| IntervalPartition::new(params.min_time, params.max_time))
                .collect(),
            stats: StateStatistics::new(params),
        }
    }

    /// The outgoing partition for one symbol.
    pub fn partition(&self, symbol: usize) -> &IntervalPartition {
        &self.partitions[symbol]
    }

    /// Mutable access to the outgoing partition for one symbol.
    pub fn partition_mut(&mut self, symbol: usize) -> &mut IntervalPartition {
        &mut self.partitions[symbol]
    }

    /// The interval of `symbol` containing the delay `time`.
    pub fn interval(&self, symbol: usize, time: Time) -> &Interval {
        self.partitions[symbol].lookup(time)
    }

    /// Mutable variant of [`Self::interval`].
    pub fn interval_mut(&mut self, symbol: usize, time: Time) -> &mut Interval {
        self.partitions[symbol].lookup_mut(time)
    }

    /// Target of the interval of `symbol` containing `time`.
    pub fn target(&self, symbol: usize, time: Time) -> Option<StateId> {
        self.interval(symbol, time).target()
    }

    /// Place a tail into the interval indexed by its symbol and delay and
    /// record the observation.
    pub fn add_tail(&mut self, symbol: usize, time: Time, bar: usize, tail: TailId) {
        self.partitions[symbol].lookup_mut(time).add_tail(time, tail);
        self.stats.add_count(symbol, bar);
    }

    /// Remove a tail and forget the observation.
    pub fn del_tail(&mut self, symbol: usize, time: Time, bar: usize, tail: TailId) {
        self.partitions[symbol].lookup_mut(time).del_tail(time, tail);
        self.stats.del_count(symbol, bar);
    }
}
