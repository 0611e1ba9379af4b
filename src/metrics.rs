//! Counters exported through the `metrics` facade.
//!
//! Nothing is recorded unless the host installs a recorder.

/// An item reached the end of the pipeline through the sink `stage`
pub(crate) fn record_processed(stage: &str) {
    metrics::counter!("pipewright_items_processed_total", "stage" => stage.to_string()).increment(1);
}

/// A stage body failed for one item
pub(crate) fn record_error(stage: &str) {
    metrics::counter!("pipewright_stage_errors_total", "stage" => stage.to_string()).increment(1);
}

/// A stage was fully torn down
pub(crate) fn record_stage_finished(stage: &str) {
    metrics::counter!("pipewright_stages_finished_total", "stage" => stage.to_string()).increment(1);
}

/// A task group task failed
pub(crate) fn record_task_failed() {
    metrics::counter!("pipewright_tasks_failed_total").increment(1);
}
