use retrybench_core::{
    BenchmarkSession, ExerciseResult, SessionConfig, SessionStats, Termination,
};
use uuid::Uuid;

/// Identity and timing of a run, known only to the session driver.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub id: Uuid,
    pub model: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub total_time_ms: f64,
}

/// Collects terminal exercise results in selection order.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: Vec<ExerciseResult>,
    incomplete: Vec<String>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: ExerciseResult) {
        self.results.push(result);
    }

    pub fn mark_incomplete(&mut self, name: impl Into<String>) {
        self.incomplete.push(name.into());
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn finalize(
        self,
        config: &SessionConfig,
        meta: RunMetadata,
        termination: Termination,
    ) -> BenchmarkSession {
        let stats = SessionStats::from_results(&self.results, meta.total_time_ms);
        BenchmarkSession {
            id: meta.id,
            model: meta.model,
            config: config.clone(),
            results: self.results,
            stats,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            termination,
            incomplete: self.incomplete,
        }
    }
}
