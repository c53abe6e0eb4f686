//! Statistical scoring of candidate refinements.
//!
//! Two modes, selected by [`TestType`]: per-level chi-squared tests whose
//! p-values are combined with Fisher's method, or one aggregated
//! log-likelihood ratio evaluated as a G statistic. Elementary tests pool
//! sparse categories below `min_data` and apply the Yates continuity
//! correction to small counts.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use rtinfer_core::prelude::*;

use crate::automaton::Automaton;

/// Upper-tail probability of the chi-squared distribution, the quantile
/// oracle behind every p-value here.
pub fn chisq_q(x: f64, dof: f64) -> f64 {
    ChiSquared::new(dof)
        .expect("degrees of freedom must be positive")
        .sf(x)
}

/// Fisher's method: independent p-values combine via `-2 Σ log p`, which is
/// chi-squared distributed with two degrees of freedom per test.
#[derive(Clone, Copy, Debug, Default)]
pub struct Consensus {
    sum_z_values: f64,
    num_tests: f64,
}

impl Consensus {
    /// Fold one p-value into the consensus.
    pub fn add(&mut self, p_value: f64, max_p_value: f64) {
        let p_value = if p_value == 1.0 { max_p_value } else { p_value };
        self.sum_z_values += -2.0 * p_value.ln();
        self.num_tests += 1.0;
    }

    /// The combined p-value, or -1 when no test contributed.
    pub fn finish(&self) -> f64 {
        if self.num_tests == 0.0 {
            return -1.0;
        }
        chisq_q(self.sum_z_values, 2.0 * self.num_tests)
    }
}

/// The aggregated likelihood-ratio statistic: a running log-ratio plus one
/// degree of freedom per surviving category.
#[derive(Clone, Copy, Debug, Default)]
pub struct LikelihoodAggregate {
    ml_ratio: f64,
    ml_parameters: i64,
}

impl LikelihoodAggregate {
    /// Fold one elementary test into the aggregate.
    pub fn add(&mut self, ratio: f64, parameters: i64) {
        self.ml_ratio += ratio;
        self.ml_parameters += parameters;
    }

    /// The p-value of `-2 G` under chi-squared, or -1 when nothing
    /// contributed.
    pub fn finish(&self) -> f64 {
        if self.ml_ratio == 0.0 && self.ml_parameters == 0 {
            return -1.0;
        }
        chisq_q(-2.0 * self.ml_ratio, self.ml_parameters as f64)
    }
}

/// The per-test accumulator, a stack local of every `test_*` call.
#[derive(Clone, Copy, Debug)]
pub enum ScoreAccumulator {
    /// Fisher consensus over chi-squared tests.
    Consensus(Consensus),
    /// Aggregated likelihood ratio.
    Likelihood(LikelihoodAggregate),
}

impl ScoreAccumulator {
    /// A zeroed accumulator for the selected test.
    pub fn new(test_type: TestType) -> Self {
        match test_type {
            TestType::ChiSquared => Self::Consensus(Consensus::default()),
            TestType::LikelihoodRatio => Self::Likelihood(LikelihoodAggregate::default()),
        }
    }

    /// Score one (old, new) state pair of a merge: symbol and time
    /// distributions.
    pub fn record_merge(&mut self, old: &StateStatistics, new: &StateStatistics, params: &Params) {
        match self {
            Self::Consensus(consensus) => {
                chi2_symbols(consensus, old, new, params);
                chi2_time(consensus, old, new, params);
            }
            Self::Likelihood(aggregate) => {
                likelihood_symbols(aggregate, old, new, params);
                likelihood_time(aggregate, old, new, params);
            }
        }
    }

    /// Score one state of a split: remaining counts against marks.
    pub fn record_split(&mut self, stats: &StateStatistics, params: &Params) {
        match self {
            Self::Consensus(consensus) => {
                chi2_symbols_split(consensus, stats, params);
                chi2_time_split(consensus, stats, params);
            }
            Self::Likelihood(aggregate) => {
                likelihood_symbols_split(aggregate, stats, params);
                likelihood_time_split(aggregate, stats, params);
            }
        }
    }

    /// The final aggregated p-value, or -1 when no test contributed.
    pub fn finish(&self) -> f64 {
        match self {
            Self::Consensus(consensus) => consensus.finish(),
            Self::Likelihood(aggregate) => aggregate.finish(),
        }
    }
}

/// One 2x2-ish chi-squared contribution of a category, with the Yates
/// continuity correction whenever a small count is involved.
fn chi2_contribution(first: f64, second: f64, total1: f64, total2: f64, min_data: f64) -> f64 {
    let total = first + second;
    let expected1 = total1 * total / (total1 + total2);
    let expected2 = total2 * total / (total1 + total2);
    let mut top1 = first - expected1;
    let mut top2 = second - expected2;
    if first < min_data || second < min_data {
        top1 = top1.abs() - 0.5;
        top2 = top2.abs() - 0.5;
    }
    top1 * top1 / expected1 + top2 * top2 / expected2
}

/// The chi-squared statistic of two count vectors, pooling categories that
/// are sparse on both sides. The pool is folded back into the totals only
/// when it is sparse on both sides as well. Returns the statistic and its
/// degrees of freedom, or `None` when fewer than two categories survive or
/// either side lacks data.
fn chi2_statistic(
    a: &[i64],
    b: &[i64],
    total_a: i64,
    total_b: i64,
    min_data: i64,
) -> Option<(f64, f64)> {
    if total_a < min_data || total_b < min_data {
        return None;
    }
    let mut pool_a = 0;
    let mut pool_b = 0;
    for i in 0..a.len() {
        if a[i] < min_data && b[i] < min_data {
            pool_a += a[i];
            pool_b += b[i];
        }
    }
    let (mut total_a, mut total_b) = (total_a, total_b);
    if pool_a < min_data && pool_b < min_data {
        total_a -= pool_a;
        total_b -= pool_b;
        pool_a = 0;
        pool_b = 0;
    }

    let mut value = 0.0;
    let mut dof = -1.0;
    for i in 0..a.len() {
        if a[i] < min_data && b[i] < min_data {
            continue;
        }
        value += chi2_contribution(
            a[i] as f64,
            b[i] as f64,
            total_a as f64,
            total_b as f64,
            min_data as f64,
        );
        dof += 1.0;
    }
    if pool_a > min_data || pool_b > min_data {
        value += chi2_contribution(
            pool_a as f64,
            pool_b as f64,
            total_a as f64,
            total_b as f64,
            min_data as f64,
        );
        dof += 1.0;
    }
    (dof >= 1.0).then_some((value, dof))
}

/// The log-likelihood ratio of two count vectors against their pooled
/// distribution, with one parameter per surviving category. Unlike the
/// chi-squared variant the pool folds back into the totals when it is
/// sparse on *either* side.
fn likelihood_statistic(
    a: &[i64],
    b: &[i64],
    total_a: i64,
    total_b: i64,
    min_data: i64,
) -> (i64, f64) {
    if total_a < min_data || total_b < min_data {
        return (0, 0.0);
    }
    let mut pool_a = 0;
    let mut pool_b = 0;
    for i in 0..a.len() {
        if a[i] < min_data && b[i] < min_data {
            pool_a += a[i];
            pool_b += b[i];
        }
    }
    let (mut total_a, mut total_b) = (total_a, total_b);
    if pool_a < min_data || pool_b < min_data {
        total_a -= pool_a;
        total_b -= pool_b;
        pool_a = 0;
        pool_b = 0;
    }

    let mut parameters = 0;
    let mut ratio = 0.0;
    let fold = |first: i64, second: i64| {
        let pooled = (first + second) as f64 / (total_a + total_b) as f64;
        // A zero count contributes nothing; probability one keeps its log
        // term from blowing up.
        let local_a = if first != 0 {
            first as f64 / total_a as f64
        } else {
            1.0
        };
        let local_b = if second != 0 {
            second as f64 / total_b as f64
        } else {
            1.0
        };
        let mut term = 0.0;
        term += first as f64 * pooled.ln() - first as f64 * local_a.ln();
        term += second as f64 * pooled.ln() - second as f64 * local_b.ln();
        term
    };
    for i in 0..a.len() {
        if a[i] < min_data && b[i] < min_data {
            continue;
        }
        ratio += fold(a[i], b[i]);
        parameters += 1;
    }
    if pool_a > min_data || pool_b > min_data {
        ratio += fold(pool_a, pool_b);
        parameters += 1;
    }
    if parameters > 0 {
        (parameters, ratio)
    } else {
        (0, 0.0)
    }
}

fn score_chi2(consensus: &mut Consensus, a: &[i64], b: &[i64], ta: i64, tb: i64, p: &Params) -> f64 {
    match chi2_statistic(a, b, ta, tb, p.min_data) {
        Some((value, dof)) => {
            let p_value = chisq_q(value, dof).max(p.min_p_value);
            consensus.add(p_value, p.max_p_value);
            p_value
        }
        None => -1.0,
    }
}

fn score_likelihood(
    aggregate: &mut LikelihoodAggregate,
    a: &[i64],
    b: &[i64],
    ta: i64,
    tb: i64,
    p: &Params,
) -> (i64, f64) {
    let (parameters, ratio) = likelihood_statistic(a, b, ta, tb, p.min_data);
    if parameters > 0 {
        aggregate.add(ratio, parameters);
    }
    (parameters, ratio)
}

/// Chi-squared test of the symbol distributions of a merge.
pub fn chi2_symbols(
    consensus: &mut Consensus,
    old: &StateStatistics,
    new: &StateStatistics,
    p: &Params,
) -> f64 {
    score_chi2(
        consensus,
        old.symbol_counts(),
        new.symbol_counts(),
        old.total_counts(),
        new.total_counts(),
        p,
    )
}

/// Chi-squared test of the symbol distributions of a split: remaining
/// counts against marks.
pub fn chi2_symbols_split(consensus: &mut Consensus, stats: &StateStatistics, p: &Params) -> f64 {
    score_chi2(
        consensus,
        stats.symbol_counts(),
        stats.symbol_marks(),
        stats.total_counts(),
        stats.total_marks(),
        p,
    )
}

/// Chi-squared test of the time-bin distributions of a merge.
pub fn chi2_time(
    consensus: &mut Consensus,
    old: &StateStatistics,
    new: &StateStatistics,
    p: &Params,
) -> f64 {
    score_chi2(
        consensus,
        old.time_counts(),
        new.time_counts(),
        old.total_counts(),
        new.total_counts(),
        p,
    )
}

/// Chi-squared test of the time-bin distributions of a split.
pub fn chi2_time_split(consensus: &mut Consensus, stats: &StateStatistics, p: &Params) -> f64 {
    score_chi2(
        consensus,
        stats.time_counts(),
        stats.time_marks(),
        stats.total_counts(),
        stats.total_marks(),
        p,
    )
}

/// Likelihood-ratio test of the symbol distributions of a merge.
pub fn likelihood_symbols(
    aggregate: &mut LikelihoodAggregate,
    old: &StateStatistics,
    new: &StateStatistics,
    p: &Params,
) -> (i64, f64) {
    score_likelihood(
        aggregate,
        old.symbol_counts(),
        new.symbol_counts(),
        old.total_counts(),
        new.total_counts(),
        p,
    )
}

/// Likelihood-ratio test of the symbol distributions of a split.
pub fn likelihood_symbols_split(
    aggregate: &mut LikelihoodAggregate,
    stats: &StateStatistics,
    p: &Params,
) -> (i64, f64) {
    score_likelihood(
        aggregate,
        stats.symbol_counts(),
        stats.symbol_marks(),
        stats.total_counts(),
        stats.total_marks(),
        p,
    )
}

/// Likelihood-ratio test of the time-bin distributions of a merge.
pub fn likelihood_time(
    aggregate: &mut LikelihoodAggregate,
    old: &StateStatistics,
    new: &StateStatistics,
    p: &Params,
) -> (i64, f64) {
    score_likelihood(
        aggregate,
        old.time_counts(),
        new.time_counts(),
        old.total_counts(),
        new.total_counts(),
        p,
    )
}

/// Likelihood-ratio test of the time-bin distributions of a split.
pub fn likelihood_time_split(
    aggregate: &mut LikelihoodAggregate,
    stats: &StateStatistics,
    p: &Params,
) -> (i64, f64) {
    score_likelihood(
        aggregate,
        stats.time_counts(),
        stats.time_marks(),
        stats.total_counts(),
        stats.total_marks(),
        p,
    )
}

impl Automaton {
    /// Score the merge that would redirect the interval of `symbol`
    /// containing `time` to `new_target`, without changing the automaton.
    /// The interval is temporarily repointed, the old subtree pre-split so
    /// corresponding intervals line up, both subtrees are traversed with
    /// per-level tests, and everything is restored afterwards.
    pub fn test_point(
        &mut self,
        state: StateId,
        symbol: usize,
        time: Time,
        new_target: StateId,
    ) -> f64 {
        let Some(old_target) = self.states[state].interval(symbol, time).target() else {
            return 0.0;
        };
        assert_ne!(old_target, new_target);

        let mut accumulator = ScoreAccumulator::new(self.params.test_type);
        self.states[state]
            .interval_mut(symbol, time)
            .set_target(Some(new_target));
        self.pre_split(old_target, new_target);
        self.recurse_test_merge(Some(old_target), Some(new_target), &mut accumulator);
        self.un_pre_split(old_target);
        self.states[state]
            .interval_mut(symbol, time)
            .set_target(Some(old_target));

        accumulator.finish()
    }

    fn recurse_test_merge(
        &self,
        old: Option<StateId>,
        new: Option<StateId>,
        accumulator: &mut ScoreAccumulator,
    ) {
        let (Some(old), Some(new)) = (old, new) else {
            return;
        };
        accumulator.record_merge(&self.states[old].stats, &self.states[new].stats, &self.params);
        for symbol in 0..self.params.max_symbol {
            let old_partition = self.states[old].partition(symbol);
            let new_partition = self.states[new].partition(symbol);
            for (old_interval, new_interval) in old_partition.iter().zip(new_partition.iter()) {
                if (old_interval.len() as i64) < self.params.min_data
                    || (new_interval.len() as i64) < self.params.min_data
                {
                    continue;
                }
                self.recurse_test_merge(old_interval.target(), new_interval.target(), accumulator);
            }
        }
    }

    /// Score the split of the interval of `symbol` containing `time` at
    /// `time`. Tails with delay `<= time` are marked (together with their
    /// downstream chains) and the subtree is traversed comparing counts
    /// against marks. Marks persist so consecutive probes at increasing
    /// times stay incremental; the caller clears them via
    /// [`Automaton::clear_marked`].
    pub fn test_split(&mut self, state: StateId, symbol: usize, time: Time) -> f64 {
        let mut accumulator = ScoreAccumulator::new(self.params.test_type);
        let Some(target) = self.states[state].interval(symbol, time).target() else {
            return 0.0;
        };
        let tails: Vec<(Time, TailId)> = self.states[state]
            .interval(symbol, time)
            .tails()
            .iter()
            .collect();
        for (tail_time, tail) in tails {
            if tail_time <= time {
                self.mark(state, tail);
            } else {
                debug_assert!(!self.is_marked(tail));
            }
        }
        self.recurse_test_split(Some(target), &mut accumulator);
        accumulator.finish()
    }

    fn recurse_test_split(&self, state: Option<StateId>, accumulator: &mut ScoreAccumulator) {
        let Some(state) = state else {
            return;
        };
        accumulator.record_split(&self.states[state].stats, &self.params);
        for symbol in 0..self.params.max_symbol {
            for interval in self.states[state].partition(symbol).iter() {
                let remaining = interval.len() as i64 - interval.num_marked() as i64;
                if remaining < self.params.min_data
                    || (interval.num_marked() as i64) < self.params.min_data
                {
                    continue;
                }
                self.recurse_test_split(interval.target(), accumulator);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            max_symbol: 2,
            min_time: 0,
            max_time: 40,
            num_histogram_bars: 4,
            time_iqr25: 10,
            time_iqr50: 20,
            time_iqr75: 30,
            min_data: 10,
            min_p_value: 1e-101,
            max_p_value: 1.0 - 1e-101,
            test_type: TestType::ChiSquared,
            significance: 0.05,
        }
    }

    #[test]
    fn chisq_q_sanity() {
        assert!((chisq_q(0.0, 2.0) - 1.0).abs() < 1e-12);
        assert!(chisq_q(10.0, 2.0) < chisq_q(1.0, 2.0));
        // 95% quantile of chi-squared with one degree of freedom.
        assert!((chisq_q(3.841, 1.0) - 0.05).abs() < 1e-3);
    }

    #[test]
    fn identical_distributions_score_high() {
        let mut consensus = Consensus::default();
        let p = params();
        let value = score_chi2(&mut consensus, &[20, 20], &[20, 20], 40, 40, &p);
        assert!((value - 1.0).abs() < 1e-9);
        // The consensus saw exactly one test.
        assert!(consensus.finish() > 0.9);
    }

    #[test]
    fn disjoint_distributions_score_low() {
        let mut consensus = Consensus::default();
        let p = params();
        let value = score_chi2(&mut consensus, &[40, 0], &[0, 40], 40, 40, &p);
        assert!(value < 1e-9);
        assert!(value >= p.min_p_value);
    }

    #[test]
    fn insufficient_data_contributes_nothing() {
        let mut consensus = Consensus::default();
        let p = params();
        assert_eq!(score_chi2(&mut consensus, &[5, 4], &[20, 20], 9, 40, &p), -1.0);
        assert_eq!(consensus.finish(), -1.0);
    }

    #[test]
    fn sparse_categories_are_pooled() {
        let p = params();
        // Categories 1 and 2 are sparse on both sides; their pool (6 vs 8)
        // stays below min_data on both sides, so it folds into the totals
        // and only category 0 survives: too few categories for a test.
        assert_eq!(chi2_statistic(&[30, 3, 3], &[25, 4, 4], 36, 33, p.min_data), None);
        // With a pool that is large on one side, the pool becomes its own
        // category and the test runs with two degrees of freedom... one
        // category plus the pool, so dof = 1.
        let (_, dof) = chi2_statistic(&[30, 9, 9], &[25, 2, 2], 48, 29, p.min_data).unwrap();
        assert_eq!(dof, 1.0);
    }

    #[test]
    fn yates_correction_applies_to_small_counts() {
        // first = 5 < min_data triggers the correction.
        let corrected = chi2_contribution(5.0, 35.0, 40.0, 40.0, 10.0);
        let uncorrected = chi2_contribution(15.0, 25.0, 40.0, 40.0, 10.0);
        // |5 - 20| - 0.5 = 14.5 squared over 20, twice.
        assert!((corrected - 2.0 * (14.5 * 14.5) / 20.0).abs() < 1e-9);
        assert!((uncorrected - 2.0 * (5.0 * 5.0) / 20.0).abs() < 1e-9);
    }

    #[test]
    fn likelihood_ratio_of_identical_distributions_is_zero() {
        let p = params();
        let (parameters, ratio) = likelihood_statistic(&[20, 20], &[20, 20], 40, 40, p.min_data);
        assert_eq!(parameters, 2);
        assert!(ratio.abs() < 1e-12);
        let mut aggregate = LikelihoodAggregate::default();
        aggregate.add(ratio, parameters);
        assert!((aggregate.finish() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn likelihood_pooling_uses_the_or_guard() {
        let p = params();
        // Pool is 9 vs 12: sparse on one side only. The chi-squared variant
        // keeps the pool, the likelihood variant folds it into the totals.
        let a = &[30, 5, 4];
        let b = &[25, 6, 6];
        let chi = chi2_statistic(a, b, 39, 37, p.min_data);
        assert!(chi.is_none() || chi.unwrap().1 >= 1.0);
        let (parameters, _) = likelihood_statistic(a, b, 39, 37, p.min_data);
        // Only category 0 survives for the likelihood variant.
        assert_eq!(parameters, 1);
    }

    #[test]
    fn zero_counts_use_probability_one() {
        let p = params();
        let (parameters, ratio) = likelihood_statistic(&[0, 40], &[20, 20], 40, 40, p.min_data);
        assert_eq!(parameters, 2);
        assert!(ratio.is_finite());
        assert!(ratio < 0.0);
    }

    fn small_automaton() -> Automaton {
        let sample =
            TimedSample::parse("4 2\n2 a 1 a 1\n2 a 1 b 2\n2 b 2 a 1\n2 b 2 b 2\n").unwrap();
        let params = Params::for_sample(&sample, TestType::ChiSquared, 0.05);
        Automaton::new(sample, params)
    }

    #[test]
    fn test_point_leaves_no_trace() {
        let mut automaton = small_automaton();
        let before = automaton.render_full();
        let root = automaton.root();
        // Too little data for any elementary test, but the probe still
        // exercises the full pre-split and restore machinery.
        let score = automaton.test_point(root, 1, 2, root);
        assert_eq!(score, -1.0);
        assert_eq!(before, automaton.render_full());
        automaton.check_consistency();
    }

    #[test]
    fn test_split_leaves_no_trace_after_clearing() {
        let mut automaton = small_automaton();
        let before = automaton.render_full();
        let root = automaton.root();
        automaton.test_split(root, 0, 1);
        automaton.clear_marked(root, 0, 2);
        assert_eq!(before, automaton.render_full());
        automaton.check_consistency();
    }
}
