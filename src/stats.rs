//! Sort-based latency statistics.
//!
//! Percentiles use a fixed interpolated-rank definition so that small-sample
//! values are exact and reproducible: `position = (n+1)·p/100`, linear
//! interpolation between the two neighbouring ranks, clamped to the first and
//! last value. Other conventions (nearest-rank, histogram sketches) disagree
//! on small samples and are deliberately not used.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{PercentileSet, StatusAggregate};

#[derive(Error, Debug, PartialEq)]
pub enum StatsError {
    #[error("Cannot compute a percentile of an empty sample set")]
    EmptyInput,

    #[error("Percentile {0} is outside [0, 100]")]
    PercentileOutOfRange(f64),
}

/// Aggregate over one set of latency samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: PercentileSet,
}

/// Computes the `p`-th percentile of `values`.
///
/// `position = (n+1)·p/100`, `index = position − 1`; values below the first
/// rank clamp to `values[0]`, above the last rank to `values[n−1]`, and
/// anything in between interpolates linearly between the two neighbours.
pub fn percentile(values: &[f64], p: f64) -> Result<f64, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::PercentileOutOfRange(p));
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));

    let n = sorted.len();
    let position = (n as f64 + 1.0) * p / 100.0;
    let index = position - 1.0;

    if index < 0.0 {
        return Ok(sorted[0]);
    }
    let k = index.floor() as usize;
    let f = index - index.floor();
    if k >= n - 1 {
        return Ok(sorted[n - 1]);
    }
    Ok(sorted[k] + f * (sorted[k + 1] - sorted[k]))
}

fn percentile_set(values: &[f64]) -> PercentileSet {
    // Only reachable with a non-empty sample set and in-range percentiles.
    PercentileSet {
        p50: percentile(values, 50.0).unwrap_or(0.0),
        p75: percentile(values, 75.0).unwrap_or(0.0),
        p90: percentile(values, 90.0).unwrap_or(0.0),
        p95: percentile(values, 95.0).unwrap_or(0.0),
        p99: percentile(values, 99.0).unwrap_or(0.0),
    }
}

/// Aggregates a set of latency samples.
///
/// Zero samples produce the all-zero aggregate rather than an error.
pub fn aggregate(values: &[f64]) -> Aggregate {
    if values.is_empty() {
        return Aggregate::default();
    }

    let count = values.len() as u64;
    let sum: f64 = values.iter().sum();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    Aggregate {
        count,
        sum,
        avg: sum / count as f64,
        min,
        max,
        percentiles: percentile_set(values),
    }
}

/// Groups `(status, latency)` samples by status code and aggregates each
/// group.
pub fn per_status(samples: &[(u16, f64)]) -> BTreeMap<u16, StatusAggregate> {
    let mut grouped: BTreeMap<u16, Vec<f64>> = BTreeMap::new();
    for (status, latency) in samples {
        grouped.entry(*status).or_default().push(*latency);
    }

    grouped
        .into_iter()
        .map(|(status, values)| {
            let agg = aggregate(&values);
            (
                status,
                StatusAggregate {
                    count: agg.count,
                    min: agg.min,
                    avg: agg.avg,
                    max: agg.max,
                    percentiles: agg.percentiles,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_formula_p50_of_ten_values() {
        // position = 11 · 0.5 = 5.5, index = 4.5 → 50 + 0.5 · (60 − 50) = 55.
        let values: Vec<f64> = (1..=10).map(|v| (v * 10) as f64).collect();
        assert_eq!(percentile(&values, 50.0).unwrap(), 55.0);
    }

    #[test]
    fn pinned_formula_other_ranks() {
        let values: Vec<f64> = (1..=10).map(|v| (v * 10) as f64).collect();
        // position = 11 · 0.75 = 8.25, index = 7.25 → 80 + 0.25 · 10 = 82.5.
        assert_eq!(percentile(&values, 75.0).unwrap(), 82.5);
        // position = 11 · 0.9 = 9.9, index = 8.9 → 90 + 0.9 · 10 = 99.
        assert!((percentile(&values, 90.0).unwrap() - 99.0).abs() < 1e-9);
        // position = 11 · 0.99 = 10.89, index = 9.89 ≥ n−1 → last value.
        assert_eq!(percentile(&values, 99.0).unwrap(), 100.0);
    }

    #[test]
    fn percentile_clamps_at_the_edges() {
        let values = vec![5.0, 1.0, 3.0];
        // p=0: position = 0, index = −1 < 0 → smallest value.
        assert_eq!(percentile(&values, 0.0).unwrap(), 1.0);
        // p=100: index = 3 ≥ n−1 → largest value.
        assert_eq!(percentile(&values, 100.0).unwrap(), 5.0);
    }

    #[test]
    fn percentile_of_single_value_is_that_value() {
        let values = vec![42.0];
        for p in [0.0, 50.0, 99.0, 100.0] {
            assert_eq!(percentile(&values, p).unwrap(), 42.0);
        }
    }

    #[test]
    fn percentile_sorts_its_input() {
        let values = vec![100.0, 10.0, 50.0, 30.0, 70.0, 20.0, 90.0, 40.0, 80.0, 60.0];
        assert_eq!(percentile(&values, 50.0).unwrap(), 55.0);
    }

    #[test]
    fn percentile_rejects_empty_input() {
        assert_eq!(percentile(&[], 50.0), Err(StatsError::EmptyInput));
    }

    #[test]
    fn percentile_rejects_out_of_range() {
        let values = vec![1.0];
        assert_eq!(
            percentile(&values, -1.0),
            Err(StatsError::PercentileOutOfRange(-1.0))
        );
        assert_eq!(
            percentile(&values, 100.5),
            Err(StatsError::PercentileOutOfRange(100.5))
        );
    }

    #[test]
    fn aggregate_of_empty_input_is_all_zero() {
        let agg = aggregate(&[]);
        assert_eq!(agg.count, 0);
        assert_eq!(agg.avg, 0.0);
        assert_eq!(agg.min, 0.0);
        assert_eq!(agg.max, 0.0);
        assert_eq!(agg.percentiles.p99, 0.0);
    }

    #[test]
    fn aggregate_basic_fields() {
        let agg = aggregate(&[10.0, 20.0, 30.0]);
        assert_eq!(agg.count, 3);
        assert_eq!(agg.sum, 60.0);
        assert_eq!(agg.avg, 20.0);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 30.0);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let values: Vec<f64> = (1..=37).map(|v| (v * 3 % 41) as f64).collect();
        let agg = aggregate(&values);
        assert!(agg.min <= agg.percentiles.p50);
        assert!(agg.percentiles.p50 <= agg.percentiles.p75);
        assert!(agg.percentiles.p75 <= agg.percentiles.p90);
        assert!(agg.percentiles.p90 <= agg.percentiles.p95);
        assert!(agg.percentiles.p95 <= agg.percentiles.p99);
        assert!(agg.percentiles.p99 <= agg.max);
    }

    #[test]
    fn per_status_groups_by_code() {
        let samples = vec![(200, 10.0), (200, 20.0), (503, 100.0)];
        let grouped = per_status(&samples);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&200].count, 2);
        assert_eq!(grouped[&200].avg, 15.0);
        assert_eq!(grouped[&503].count, 1);
        assert_eq!(grouped[&503].max, 100.0);
    }

    #[test]
    fn per_status_of_no_samples_is_empty() {
        assert!(per_status(&[]).is_empty());
    }
}
