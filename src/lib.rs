//! Learning probabilistic real-time automata from unlabelled timed strings.
//!
//! The learner starts from a prefix tree that memorizes every timed suffix
//! of the corpus and repeatedly applies one of three reversible refinements:
//! *point* (merge a tree state into a colored state), *split* (subdivide a
//! transition interval at a timestamp) or *color* (promote a tree state into
//! the automaton). Candidate refinements are ranked by statistical tests
//! over the symbol and inter-event-time distributions, and a greedy or
//! best-first search keeps the automaton with the lowest AIC.

pub mod automaton;
pub mod refine;
pub mod scoring;
pub mod search;
pub mod state;

/// The prelude is supposed to make using this package easier. Importing
/// everything, i.e. `use rtinfer::prelude::*;` should be enough.
pub mod prelude {
    pub use crate::automaton::Automaton;
    pub use crate::scoring::{chisq_q, Consensus, LikelihoodAggregate, ScoreAccumulator};
    pub use crate::search::{Refinement, RefinementKind, Searcher};
    pub use crate::state::TimedState;
    pub use rtinfer_core::prelude::*;
}
