//! Aggregation of repeated runs and threshold checks.

use std::collections::BTreeMap;

use tracing::debug;

use crate::engine::ExecutionResult;
use crate::response::PerformanceResults;

pub const MAX_EXECUTION_TIME: &str = "max_execution_time";
pub const MAX_MEMORY_MB: &str = "max_memory_mb";
pub const MAX_CPU_PERCENT: &str = "max_cpu_percent";

/// Timing and resource aggregates over `runs`. Failed runs count toward
/// `iterations` but not toward the averages.
pub fn aggregate(runs: &[ExecutionResult]) -> PerformanceResults {
    let ok: Vec<&ExecutionResult> = runs.iter().filter(|r| r.success()).collect();
    let mut results = PerformanceResults {
        iterations: runs.len() as u32,
        successful_iterations: ok.len() as u32,
        ..Default::default()
    };
    if ok.is_empty() {
        return results;
    }
    let n = ok.len() as f64;
    let times = ok.iter().map(|r| r.execution_time);
    results.avg_execution_time = times.clone().sum::<f64>() / n;
    results.min_execution_time = times.clone().fold(f64::INFINITY, f64::min);
    results.max_execution_time = times.fold(0.0, f64::max);
    results.avg_memory_mb = ok.iter().map(|r| r.memory_usage_mb).sum::<f64>() / n;
    results.peak_memory_mb = ok.iter().map(|r| r.memory_usage_mb).fold(0.0, f64::max);
    results.avg_cpu_percent = ok.iter().map(|r| r.cpu_usage_percent).sum::<f64>() / n;
    results.peak_cpu_percent = ok.iter().map(|r| r.cpu_usage_percent).fold(0.0, f64::max);
    results
}

/// Record every breached threshold in `results` and return whether the run
/// passed. `max_cpu_percent` falls back to `default_cpu_percent`.
pub fn check_thresholds(
    results: &mut PerformanceResults,
    thresholds: &BTreeMap<String, f64>,
    default_cpu_percent: f64,
) -> bool {
    let mut violations = BTreeMap::new();
    for (name, limit) in thresholds {
        let observed = match name.as_str() {
            MAX_EXECUTION_TIME => results.avg_execution_time,
            MAX_MEMORY_MB => results.peak_memory_mb,
            MAX_CPU_PERCENT => results.peak_cpu_percent,
            other => {
                debug!(threshold = other, "performance: unknown threshold ignored");
                continue;
            }
        };
        if observed > *limit {
            violations.insert(name.clone(), format!("{observed:.3} > {limit}"));
        }
    }
    if !thresholds.contains_key(MAX_CPU_PERCENT) && results.peak_cpu_percent > default_cpu_percent
    {
        violations.insert(
            MAX_CPU_PERCENT.to_string(),
            format!("{:.3} > {default_cpu_percent}", results.peak_cpu_percent),
        );
    }
    let passed = violations.is_empty()
        && results.iterations > 0
        && results.successful_iterations == results.iterations;
    results.threshold_violations = violations;
    passed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(secs: f64, mem: f64, cpu: f64) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(0),
            execution_time: secs,
            memory_usage_mb: mem,
            cpu_usage_percent: cpu,
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_over_successful_runs() {
        let mut failed = run(9.0, 900.0, 99.0);
        failed.exit_code = Some(1);
        let r = aggregate(&[run(1.0, 10.0, 20.0), run(3.0, 30.0, 40.0), failed]);
        assert_eq!(r.iterations, 3);
        assert_eq!(r.successful_iterations, 2);
        assert_eq!(r.avg_execution_time, 2.0);
        assert_eq!(r.min_execution_time, 1.0);
        assert_eq!(r.max_execution_time, 3.0);
        assert_eq!(r.peak_memory_mb, 30.0);
        assert_eq!(r.avg_cpu_percent, 30.0);
    }

    #[test]
    fn test_thresholds() {
        let mut r = aggregate(&[run(0.5, 50.0, 30.0), run(0.7, 60.0, 35.0)]);
        let thresholds = BTreeMap::from([
            (MAX_EXECUTION_TIME.to_string(), 1.0),
            (MAX_MEMORY_MB.to_string(), 40.0),
            ("bogus".to_string(), 0.0),
        ]);
        assert!(!check_thresholds(&mut r, &thresholds, 80.0));
        assert_eq!(r.threshold_violations.len(), 1);
        assert!(r.threshold_violations.contains_key(MAX_MEMORY_MB));

        let mut r = aggregate(&[run(0.5, 50.0, 30.0)]);
        assert!(check_thresholds(&mut r, &BTreeMap::new(), 80.0));
        let mut hot = aggregate(&[run(0.5, 50.0, 95.0)]);
        assert!(!check_thresholds(&mut hot, &BTreeMap::new(), 80.0));
    }

    #[test]
    fn test_failed_iteration_fails_the_test() {
        let mut failed = run(0.1, 1.0, 1.0);
        failed.timeout_occurred = true;
        let mut r = aggregate(&[run(0.1, 1.0, 1.0), failed]);
        assert!(!check_thresholds(&mut r, &BTreeMap::new(), 80.0));
    }
}
