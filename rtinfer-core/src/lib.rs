//! Core data structures for learning real-time automata from timed strings.
//!
//! This crate holds the leaves of the learner: the parsed corpus of timed
//! words, the tail (suffix) view onto it, the per-symbol interval partitions
//! that make up a state's outgoing transitions, and the occurrence statistics
//! the refinement tests compare.

pub mod alphabet;
pub mod config;
pub mod interval;
pub mod statistics;
pub mod tail;
pub mod word;

/// Alias for the integer type used for time delays and interval bounds.
pub type Time = u32;

slotmap::new_key_type! {
    /// Stable arena key identifying a state of the automaton.
    pub struct StateId;
}

/// The prelude is supposed to make using this package easier. Importing
/// everything, i.e. `use rtinfer_core::prelude::*;` should be enough.
pub mod prelude {
    pub use crate::alphabet::Alphabet;
    pub use crate::config::{Params, TestType};
    pub use crate::interval::{Interval, IntervalPartition};
    pub use crate::statistics::StateStatistics;
    pub use crate::tail::{TailId, TailSet};
    pub use crate::word::{CorpusParseError, TimedSample, TimedWord};
    pub use crate::{StateId, Time};
}
