//! Metric descriptions for the drop test engine.
//!
//! `dt-core` emits through the `metrics` facade; nothing is recorded until the
//! host process installs a recorder.

use metrics::{describe_counter, describe_gauge, Unit};

/// Every metric name emitted by the engine.
pub const METRIC_NAMES: [&str; 10] = [
    "droptest_analyses_total",
    "droptest_analysis_rejected_total",
    "droptest_uncertain_decisions_total",
    "droptest_fusion_disagreements_total",
    "droptest_model_unavailable_total",
    "droptest_archive_failures_total",
    "droptest_archive_dropped_total",
    "droptest_adaptation_runs_total",
    "droptest_adaptation_insufficient_total",
    "droptest_parameters_version",
];

/// Registers metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "droptest_analyses_total",
        Unit::Count,
        "Total number of drop tests analysed"
    );
    describe_counter!(
        "droptest_analysis_rejected_total",
        Unit::Count,
        "Measurements rejected as invalid input"
    );
    describe_counter!(
        "droptest_uncertain_decisions_total",
        Unit::Count,
        "Decisions routed to human review"
    );
    describe_counter!(
        "droptest_fusion_disagreements_total",
        Unit::Count,
        "Decisions where rule and model verdicts differed"
    );
    describe_counter!(
        "droptest_model_unavailable_total",
        Unit::Count,
        "Analyses that fell back to rule-only"
    );

    // Archive
    describe_counter!(
        "droptest_archive_failures_total",
        Unit::Count,
        "Decisions the sample store failed to persist"
    );
    describe_counter!(
        "droptest_archive_dropped_total",
        Unit::Count,
        "Decisions dropped because the archive queue was full or closed"
    );

    // Adaptation
    describe_counter!(
        "droptest_adaptation_runs_total",
        Unit::Count,
        "Adaptation runs that published new parameters"
    );
    describe_counter!(
        "droptest_adaptation_insufficient_total",
        Unit::Count,
        "Adaptation runs skipped for lack of strong labels"
    );
    describe_gauge!(
        "droptest_parameters_version",
        "Version of the currently published parameter snapshot"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let unique: HashSet<_> = METRIC_NAMES.iter().collect();
        assert_eq!(unique.len(), METRIC_NAMES.len());
        assert!(METRIC_NAMES.iter().all(|n| n.starts_with("droptest_")));
    }

    #[test]
    fn test_register_without_recorder() {
        register_metrics();
    }
}
