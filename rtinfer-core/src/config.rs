use thiserror::Error;

use crate::word::TimedSample;
use crate::Time;

/// Which statistical test drives the refinement scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestType {
    /// Aggregated log-likelihood ratio, evaluated as a G statistic.
    LikelihoodRatio,
    /// Per-level chi-squared tests combined with Fisher's method.
    ChiSquared,
}

/// Error raised when a test type code is neither 1 nor 2.
#[derive(Debug, Error)]
#[error("test type must be 1 (likelihood ratio) or 2 (chi squared), got {0}")]
pub struct UnknownTestType(pub u32);

impl TryFrom<u32> for TestType {
    type Error = UnknownTestType;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(TestType::LikelihoodRatio),
            2 => Ok(TestType::ChiSquared),
            other => Err(UnknownTestType(other)),
        }
    }
}

/// All process-wide knobs of a learning run, fixed before the search starts
/// and passed by value through the call graph.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Declared alphabet capacity; every state carries this many partitions.
    pub max_symbol: usize,
    /// Smallest representable delay, always zero.
    pub min_time: Time,
    /// Largest delay observed in the corpus.
    pub max_time: Time,
    /// Number of time histogram bins.
    pub num_histogram_bars: usize,
    /// 25th percentile of the distinct corpus delays.
    pub time_iqr25: Time,
    /// 50th percentile of the distinct corpus delays.
    pub time_iqr50: Time,
    /// 75th percentile of the distinct corpus delays.
    pub time_iqr75: Time,
    /// Smallest per-category count before rows are pooled.
    pub min_data: i64,
    /// Lower clamp for p-values entering the consensus test.
    pub min_p_value: f64,
    /// Upper clamp for p-values entering the consensus test.
    pub max_p_value: f64,
    /// The statistical test in use.
    pub test_type: TestType,
    /// Decision threshold for refinement p-values.
    pub significance: f64,
}

impl Params {
    /// Default significance threshold.
    pub const DEFAULT_SIGNIFICANCE: f64 = 0.05;

    /// Derive the parameters for a parsed corpus.
    pub fn for_sample(sample: &TimedSample, test_type: TestType, significance: f64) -> Self {
        let [time_iqr25, time_iqr50, time_iqr75] = sample.time_iqrs();
        Self {
            max_symbol: sample.alphabet().capacity(),
            min_time: 0,
            max_time: sample.max_time(),
            num_histogram_bars: 4,
            time_iqr25,
            time_iqr50,
            time_iqr75,
            min_data: 10,
            min_p_value: 1e-101,
            max_p_value: 1.0 - 1e-101,
            test_type,
            significance,
        }
    }

    /// Histogram bin of a delay value, bounded by the IQR percentiles.
    pub fn bar_of(&self, time: Time) -> usize {
        if time <= self.time_iqr25 {
            0
        } else if time <= self.time_iqr50 {
            1
        } else if time <= self.time_iqr75 {
            2
        } else {
            3
        }
    }

    /// First delay value falling into the given bin.
    pub fn bar_begin(&self, bar: usize) -> Time {
        match bar {
            0 => 0,
            1 => self.time_iqr25 + 1,
            2 => self.time_iqr50 + 1,
            _ => self.time_iqr75 + 1,
        }
    }

    /// Last delay value falling into the given bin.
    pub fn bar_end(&self, bar: usize) -> Time {
        match bar {
            0 => self.time_iqr25,
            1 => self.time_iqr50,
            2 => self.time_iqr75,
            _ => self.max_time + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            max_symbol: 1,
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
    fn histogram_bars() {
        let p = params();
        assert_eq!(p.bar_of(5), 0);
        assert_eq!(p.bar_of(10), 0);
        assert_eq!(p.bar_of(11), 1);
        assert_eq!(p.bar_of(25), 2);
        assert_eq!(p.bar_of(40), 3);
    }

    #[test]
    fn bar_bounds_cover_the_axis() {
        let p = params();
        assert_eq!(p.bar_begin(0), 0);
        for bar in 1..4 {
            assert_eq!(p.bar_begin(bar), p.bar_end(bar - 1) + 1);
        }
        assert_eq!(p.bar_end(3), p.max_time + 1);
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(TestType::try_from(1).unwrap(), TestType::LikelihoodRatio);
        assert_eq!(TestType::try_from(2).unwrap(), TestType::ChiSquared);
        assert!(TestType::try_from(0).is_err());
        assert!(TestType::try_from(3).is_err());
    }
}
