pub mod aggregator;
pub mod client;
pub mod executor;
pub mod extractor;
pub mod ollama;
pub mod orchestrator;
pub mod prompt;
pub mod report;
pub mod runner;
pub mod session;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{ResultAggregator, RunMetadata};
pub use client::{ModelClient, ModelInfo};
pub use executor::{ExecutorError, PythonWorker, WorkerSandbox};
pub use extractor::{extract, Extracted, ExtractionFailure, Origin};
pub use ollama::{OllamaClient, RetryPolicy};
pub use orchestrator::{ExerciseOutcome, RetryOrchestrator};
pub use report::{load_report, JsonReportWriter, ReportWriter};
pub use runner::TestCaseRunner;
pub use session::{SessionEvent, SessionRunner};
pub use validator::{ExactMatch, Tolerance, Unordered, Validator, ValidatorRegistry};
