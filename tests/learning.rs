//! End-to-end learning scenarios over small deterministic corpora.

use rtinfer::prelude::*;

fn learner(corpus: &str, test_type: TestType) -> Searcher {
    let sample = TimedSample::parse(corpus).unwrap();
    let params = Params::for_sample(&sample, test_type, 0.05);
    Searcher::new(Automaton::new(sample, params))
}

/// 10 words per combination of first symbol (a/b) and second symbol (a/b),
/// all delays zero. Both first-symbol branches have identical futures, so
/// the merge test should collapse them.
fn symbol_merge_corpus() -> String {
    let mut corpus = String::from("40 2\n");
    for (first, second) in [('a', 'a'), ('a', 'b'), ('b', 'a'), ('b', 'b')] {
        for _ in 0..10 {
            corpus.push_str(&format!("2 {first} 0 {second} 0\n"));
        }
    }
    corpus
}

/// 40 two-symbol words whose continuation depends on the first delay:
/// `a t b 0` for t in 1..=20 and `a t c 0` for t in 21..=40. The learner
/// should split the root's `a` axis at t = 20.
fn time_split_corpus() -> String {
    let mut corpus = String::from("40 3\n");
    for t in 1..=20 {
        corpus.push_str(&format!("2 a {t} b 0\n"));
    }
    for t in 21..=40 {
        corpus.push_str(&format!("2 a {t} c 0\n"));
    }
    corpus
}

#[test]
fn trivial_corpus_yields_the_bare_root() {
    let mut searcher = learner("1 1\n1 a 0\n", TestType::ChiSquared);
    searcher.greedy();

    // A single tail is far below the refinement threshold, so the tree is
    // reported as-is.
    assert_eq!(searcher.solutions().len(), 1);
    assert_eq!(searcher.solutions()[0].1, "0 a [0, 0]->-1 #1 p=1\n");
    assert_eq!(searcher.best_solution(), Some(8.0));
}

#[test]
fn equal_futures_are_merged() {
    let mut searcher = learner(&symbol_merge_corpus(), TestType::ChiSquared);
    searcher.greedy();

    assert_eq!(searcher.solutions().len(), 1);
    let block = &searcher.solutions()[0].1;
    // Both first-symbol branches lead to the same colored state 1.
    assert_eq!(
        block,
        "0 a [0, 0]->1 #20 p=0.5\n\
         0 b [0, 0]->1 #20 p=0.5\n\
         1 a [0, 0]->2 #20 p=0.5\n\
         1 b [0, 0]->3 #20 p=0.5\n"
    );
}

#[test]
fn greedy_restores_the_initial_tree() {
    let mut searcher = learner(&symbol_merge_corpus(), TestType::ChiSquared);
    let before = searcher.automaton().render_full();
    searcher.greedy();
    let after = searcher.automaton().render_full();
    assert_eq!(before, after);
    searcher.automaton().check_consistency();
}

#[test]
fn delay_dependent_futures_are_split() {
    let mut searcher = learner(&time_split_corpus(), TestType::ChiSquared);
    // The index-based percentiles of the distinct delays 0..=40.
    assert_eq!(searcher.automaton().params().time_iqr25, 10);
    assert_eq!(searcher.automaton().params().time_iqr50, 20);
    assert_eq!(searcher.automaton().params().time_iqr75, 30);

    searcher.best_first();

    assert!(searcher.nodes() > 0);
    let (best_aic, best_block) = searcher.solutions().last().expect("a solution was found");
    assert_eq!(Some(*best_aic), searcher.best_solution());
    // The best model separates the two delay regimes on the root's `a`
    // axis: at least two transitions with distinct interval ranges.
    let root_a_lines: Vec<&str> = best_block
        .lines()
        .filter(|line| line.starts_with("0 a "))
        .collect();
    assert!(
        root_a_lines.len() >= 2,
        "expected a split root axis, got:\n{best_block}"
    );
}

#[test]
fn learning_is_deterministic() {
    let mut first = learner(&time_split_corpus(), TestType::ChiSquared);
    first.best_first();
    let mut second = learner(&time_split_corpus(), TestType::ChiSquared);
    second.best_first();

    assert_eq!(first.solutions(), second.solutions());
    assert_eq!(first.best_solution(), second.best_solution());
    assert_eq!(first.nodes(), second.nodes());
}

#[test]
fn likelihood_ratio_mode_runs_the_same_corpus() {
    let mut searcher = learner(&symbol_merge_corpus(), TestType::LikelihoodRatio);
    searcher.greedy();
    assert_eq!(searcher.solutions().len(), 1);
    // The likelihood test also finds the two branches indistinguishable.
    assert!(searcher.solutions()[0].1.contains("0 b [0, 0]->1 "));
}

#[test]
fn saved_automata_reload_over_a_fresh_tree() {
    let sample = TimedSample::parse(&symbol_merge_corpus()).unwrap();
    let params = Params::for_sample(&sample, TestType::ChiSquared, 0.05);
    let mut automaton = Automaton::new(sample, params);

    automaton.read_saved(
        "0 a [0, 0]->1 #20 p=0.5\n\
         0 b [0, 0]->1 #20 p=0.5\n\
         1 a [0, 0]->2 #40 p=1\n\
         this line terminates reading\n",
    );
    automaton.check_consistency();

    // Root, two loaded states and the garbage sink.
    assert_eq!(automaton.num_states(), 4);
    let root = automaton.root();
    let s1 = automaton.get_state(1).unwrap();
    let s2 = automaton.get_state(2).unwrap();
    let garbage = automaton.get_state(3).unwrap();
    assert_eq!(automaton.state(root).target(0, 0), Some(s1));
    assert_eq!(automaton.state(root).target(1, 0), Some(s1));
    assert_eq!(automaton.state(s1).target(0, 0), Some(s2));
    // Transitions the file does not cover fall through to the sink.
    assert_eq!(automaton.state(s1).target(1, 0), Some(garbage));
    assert_eq!(automaton.state(s2).target(0, 0), Some(garbage));
    assert_eq!(automaton.state(garbage).target(0, 0), Some(garbage));
}
