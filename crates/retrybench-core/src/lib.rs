// Domain modules
pub mod attempt;
pub mod config;
pub mod error;
pub mod exercise;
pub mod session;
pub mod transcript;

pub use attempt::{
    final_status_of, AttemptError, AttemptErrorKind, AttemptOutcome, AttemptRecord, CaseOutcome,
    Classification, ExerciseResult,
};
pub use config::{OllamaConfig, OutputConfig, RetryBenchConfig, SessionConfig};
pub use error::{BenchError, ModelError, Result};
pub use exercise::{
    builtin_exercise_sets, load_all_exercise_sets, load_exercise_set, select_exercises,
    CatalogError, ComparisonPolicy, Difficulty, ExerciseDefinition, ExerciseSet, MethodCall,
    TestCase,
};
pub use session::{BenchmarkSession, DifficultyStats, SessionStats, Termination};
pub use transcript::{Message, Role, Transcript};

/// Milliseconds since the unix epoch, the timestamp unit used across records.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
