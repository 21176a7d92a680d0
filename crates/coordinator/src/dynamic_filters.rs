use igloo_common::{QueryId, StageId};

/// Collects runtime filters produced by one stage and pushed to scans of
/// another. The scheduler only tells it when the set of tasks producing a
/// filter is final and when a query starts a new attempt.
pub trait DynamicFilterService: Send + Sync {
    fn stage_cannot_schedule_more_tasks(&self, stage_id: &StageId, attempt_id: u32, number_of_tasks: usize);

    /// Drops filters collected by earlier attempts of the query.
    fn register_query_retry(&self, query_id: &QueryId, attempt_id: u32);
}
