//! Folds per-instance outcomes into a final task status.

use serde_json::{Value, json};

use crate::lifecycle::{BatchOutcome, InstanceOutcome, InstanceReport};
use crate::model::TaskStatus;

/// Final status, error text and result document for a finished batch.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSummary {
    /// Terminal status to record.
    pub status: TaskStatus,
    /// Failure summary; set whenever any instance or payload failed.
    pub error: Option<String>,
    /// Per-instance result document.
    pub result: Value,
}

impl TaskSummary {
    /// Summary for a batch that could not run at all.
    #[must_use]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(message.into()),
            result: json!({ "instances": [] }),
        }
    }
}

/// Aggregates `outcome`.
///
/// Instances whose payload failed count as successes for the task status
/// but are listed in the error. A batch with failures and no success fails;
/// any success makes it complete.
#[must_use]
pub fn summarise(outcome: &BatchOutcome) -> TaskSummary {
    let mut succeeded = 0_usize;
    let mut failed = Vec::new();
    let mut payload_failed = Vec::new();
    for report in &outcome.reports {
        match &report.outcome {
            InstanceOutcome::Succeeded => succeeded += 1,
            InstanceOutcome::PayloadFailed(message) => {
                succeeded += 1;
                payload_failed.push(describe(report, message));
            }
            InstanceOutcome::Failed(message) => failed.push(describe(report, message)),
            InstanceOutcome::Skipped => {}
        }
    }

    let status = if outcome.cancelled {
        TaskStatus::Terminated
    } else if succeeded == 0 && !failed.is_empty() {
        TaskStatus::Failed
    } else {
        TaskStatus::Completed
    };

    let mut sections = Vec::new();
    if !failed.is_empty() {
        sections.push(format!(
            "{} instance(s) failed: {}",
            failed.len(),
            failed.join("; ")
        ));
    }
    if !payload_failed.is_empty() {
        sections.push(format!(
            "payload failed on {} instance(s): {}",
            payload_failed.len(),
            payload_failed.join("; ")
        ));
    }
    let error = (!sections.is_empty()).then(|| sections.join(". "));

    TaskSummary {
        status,
        error,
        result: json!({
            "instances": outcome.reports,
            "succeeded": succeeded,
            "failed": failed.len(),
        }),
    }
}

fn describe(report: &InstanceReport, message: &str) -> String {
    format!("{}: {message}", report.instance_id)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::model::InstanceId;

    fn report(id: &str, outcome: InstanceOutcome) -> InstanceReport {
        InstanceReport {
            instance_id: InstanceId::new(id),
            name: id.to_owned(),
            outcome,
        }
    }

    fn batch(outcomes: Vec<InstanceOutcome>) -> BatchOutcome {
        BatchOutcome {
            reports: outcomes
                .into_iter()
                .enumerate()
                .map(|(index, outcome)| report(&format!("i-{index}"), outcome))
                .collect(),
            cancelled: false,
        }
    }

    fn failed(message: &str) -> InstanceOutcome {
        InstanceOutcome::Failed(message.to_owned())
    }

    #[rstest]
    #[case(vec![InstanceOutcome::Succeeded, InstanceOutcome::Succeeded], TaskStatus::Completed)]
    #[case(vec![failed("boom"), failed("boom")], TaskStatus::Failed)]
    #[case(vec![InstanceOutcome::Succeeded, failed("boom")], TaskStatus::Completed)]
    #[case(vec![InstanceOutcome::PayloadFailed("copy".to_owned())], TaskStatus::Completed)]
    #[case(vec![InstanceOutcome::PayloadFailed("copy".to_owned()), failed("boom")], TaskStatus::Completed)]
    fn status_follows_the_outcome_mix(
        #[case] outcomes: Vec<InstanceOutcome>,
        #[case] expected: TaskStatus,
    ) {
        assert_eq!(summarise(&batch(outcomes)).status, expected);
    }

    #[test]
    fn error_lists_exactly_the_failed_instances() {
        let summary = summarise(&batch(vec![
            InstanceOutcome::Succeeded,
            failed("quota exceeded"),
            InstanceOutcome::Succeeded,
            failed("image missing"),
        ]));
        let error = summary.error.unwrap_or_default();
        assert!(error.starts_with("2 instance(s) failed"), "{error}");
        assert!(error.contains("i-1: quota exceeded"));
        assert!(error.contains("i-3: image missing"));
        assert!(!error.contains("i-0"));
        assert!(!error.contains("i-2"));
        assert_eq!(summary.result["failed"], 2);
    }

    #[test]
    fn clean_batches_have_no_error() {
        let summary = summarise(&batch(vec![InstanceOutcome::Succeeded]));
        assert_eq!(summary.error, None);
        assert_eq!(summary.result["instances"][0]["outcome"], "succeeded");
    }

    #[test]
    fn cancelled_batches_are_terminated() {
        let mut outcome = batch(vec![InstanceOutcome::Succeeded, InstanceOutcome::Skipped]);
        outcome.cancelled = true;
        assert_eq!(summarise(&outcome).status, TaskStatus::Terminated);
    }
}
