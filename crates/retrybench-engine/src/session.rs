use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use retrybench_core::{
    now_millis, BenchError, BenchmarkSession, Classification, Difficulty, ExerciseDefinition,
    ModelError, Result, SessionConfig, SessionStats, Termination,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{ResultAggregator, RunMetadata};
use crate::client::ModelClient;
use crate::orchestrator::{ExerciseOutcome, RetryOrchestrator};
use crate::runner::TestCaseRunner;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted { id: Uuid, model: String, exercises: usize },
    ExerciseStarted { current: usize, total: usize, name: String, difficulty: Difficulty },
    AttemptStarted { exercise: String, attempt: u32 },
    AttemptFinished {
        exercise: String,
        attempt: u32,
        classification: Classification,
        error: Option<String>,
        passed_cases: usize,
        total_cases: usize,
        duration_ms: f64,
    },
    ExerciseFinished { name: String, status: Classification, attempts: u32 },
    Aborted { reason: String },
    Cancelled,
    Done { stats: SessionStats },
}

/// Runs a selection of exercises against one model and seals the session.
pub struct SessionRunner {
    client: Arc<dyn ModelClient>,
    runner: TestCaseRunner,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl SessionRunner {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            runner: TestCaseRunner::default(),
            events: None,
        }
    }

    pub fn with_runner(mut self, runner: TestCaseRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Checks everything that can be checked before the first model request.
    async fn preflight<'a>(
        &self,
        config: &SessionConfig,
        exercises: &'a [ExerciseDefinition],
    ) -> Result<Vec<&'a ExerciseDefinition>> {
        config.validate()?;

        let selected: Vec<&ExerciseDefinition> = exercises
            .iter()
            .filter(|e| config.includes(e.difficulty))
            .collect();
        if selected.is_empty() {
            return Err(BenchError::config("no exercises match the difficulty filter"));
        }

        let mut names = HashSet::new();
        for exercise in &selected {
            exercise.validate()?;
            self.runner.validators().validate_exercise(exercise)?;
            if !names.insert(exercise.name.as_str()) {
                return Err(BenchError::config(format!(
                    "duplicate exercise name '{}'",
                    exercise.name
                )));
            }
        }

        let version = self
            .runner
            .check_interpreter()
            .await
            .map_err(|e| BenchError::config(format!("python interpreter unavailable: {e}")))?;
        info!("Interpreter: {}", version);

        Ok(selected)
    }

    /// Exercises run `config.concurrency` at a time but are recorded in
    /// selection order. A model failure stops the whole run and comes back
    /// as [`BenchError::SessionAborted`] carrying everything finished so far.
    pub async fn run(
        &self,
        model: &str,
        config: &SessionConfig,
        exercises: &[ExerciseDefinition],
        cancel: CancellationToken,
    ) -> Result<BenchmarkSession> {
        let selected = self.preflight(config, exercises).await?;

        let id = Uuid::new_v4();
        let started_at = now_millis();
        let clock = Instant::now();
        let total = selected.len();
        info!(
            "Starting session {} for model {}: {} exercises, {} attempts each",
            id, model, total, config.max_attempts
        );
        self.emit(SessionEvent::SessionStarted {
            id,
            model: model.to_string(),
            exercises: total,
        })
        .await;

        let run_token = cancel.child_token();
        let orchestrator = RetryOrchestrator::new(
            Arc::clone(&self.client),
            self.runner.clone(),
            model,
            config.clone(),
        )
        .with_events(self.events.clone());

        let outcomes: Vec<std::result::Result<ExerciseOutcome, ModelError>> = {
            let orchestrator = &orchestrator;
            let run_token = &run_token;
            stream::iter(selected.iter().copied().enumerate())
                .map(move |(idx, exercise)| async move {
                    if run_token.is_cancelled() {
                        return Ok(ExerciseOutcome::Cancelled);
                    }
                    orchestrator
                        .emit(SessionEvent::ExerciseStarted {
                            current: idx + 1,
                            total,
                            name: exercise.name.clone(),
                            difficulty: exercise.difficulty,
                        })
                        .await;
                    let outcome = orchestrator.run_exercise(exercise, run_token).await;
                    if let Err(e) = &outcome {
                        warn!("Model failure on '{}', stopping session: {}", exercise.name, e);
                        run_token.cancel();
                    }
                    outcome
                })
                .buffered(config.concurrency)
                .collect()
                .await
        };

        let mut aggregator = ResultAggregator::new();
        let mut failure: Option<ModelError> = None;
        for (exercise, outcome) in selected.iter().zip(outcomes) {
            match outcome {
                Ok(ExerciseOutcome::Finished(result)) => aggregator.push(result),
                Ok(ExerciseOutcome::Cancelled) => aggregator.mark_incomplete(&exercise.name),
                Err(e) => {
                    aggregator.mark_incomplete(&exercise.name);
                    failure.get_or_insert(e);
                }
            }
        }

        let termination = match &failure {
            Some(e) => Termination::Aborted {
                reason: e.to_string(),
            },
            None if cancel.is_cancelled() => Termination::Cancelled,
            None => Termination::Completed,
        };
        let meta = RunMetadata {
            id,
            model: model.to_string(),
            started_at,
            finished_at: now_millis(),
            total_time_ms: clock.elapsed().as_secs_f64() * 1000.0,
        };
        let session = aggregator.finalize(config, meta, termination.clone());

        info!(
            "Session {}: {}/{} passed ({:.1}%), {} attempts, {:.1}s",
            session.id,
            session.stats.passed,
            session.stats.total,
            session.stats.success_rate * 100.0,
            session.stats.total_attempts,
            session.stats.total_time_ms / 1000.0
        );

        match termination {
            Termination::Aborted { reason } => {
                self.emit(SessionEvent::Aborted {
                    reason: reason.clone(),
                })
                .await;
                Err(BenchError::SessionAborted {
                    reason,
                    partial: Box::new(session),
                })
            }
            Termination::Cancelled => {
                self.emit(SessionEvent::Cancelled).await;
                Ok(session)
            }
            Termination::Completed => {
                self.emit(SessionEvent::Done {
                    stats: session.stats.clone(),
                })
                .await;
                Ok(session)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{python_available, ScriptedClient, SlowClient};
    use std::time::Duration;
    use crate::validator::ValidatorRegistry;
    use retrybench_core::{ComparisonPolicy, TestCase};
    use serde_json::json;

    fn exercise(name: &str, difficulty: Difficulty) -> ExerciseDefinition {
        ExerciseDefinition::new(
            name,
            format!("Write a function called 'double' for {name}."),
            difficulty,
            "double",
            vec![
                TestCase::new(vec![json!(2)], json!(4)),
                TestCase::new(vec![json!(-1)], json!(-2)),
            ],
        )
    }

    const GOOD: &str = "```python\ndef double(x):\n    return x * 2\n```";

    fn config(concurrency: usize) -> SessionConfig {
        SessionConfig {
            concurrency,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_selection_is_rejected() {
        let client = Arc::new(ScriptedClient::default());
        let runner = SessionRunner::new(client.clone());
        let cfg = SessionConfig {
            difficulties: vec![Difficulty::SuperHard],
            ..SessionConfig::default()
        };

        let err = runner
            .run("m", &cfg, &[exercise("a", Difficulty::Basic)], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let runner = SessionRunner::new(Arc::new(ScriptedClient::default()));
        let exercises = [exercise("a", Difficulty::Basic), exercise("a", Difficulty::Basic)];

        let err = runner
            .run("m", &config(1), &exercises, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate exercise name 'a'"));
    }

    #[tokio::test]
    async fn test_unknown_validator_is_rejected_before_requests() {
        let client = Arc::new(ScriptedClient::default());
        let runner = SessionRunner::new(client.clone());
        let ex = exercise("a", Difficulty::Basic)
            .with_comparison(ComparisonPolicy::Custom { validator: "nope".into() });

        let err = runner
            .run("m", &config(1), &[ex], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_a_configuration_error() {
        let runner = SessionRunner::new(Arc::new(ScriptedClient::default())).with_runner(
            TestCaseRunner::new(Arc::new(ValidatorRegistry::new()))
                .with_interpreter("definitely-not-a-python-binary"),
        );

        let err = runner
            .run("m", &config(1), &[exercise("a", Difficulty::Basic)], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("python interpreter unavailable"));
    }

    #[tokio::test]
    async fn test_session_keeps_selection_order() {
        if !python_available() {
            return;
        }
        let client = Arc::new(ScriptedClient::new([GOOD, "no code", GOOD, GOOD]));
        let runner = SessionRunner::new(client);
        let exercises = [
            exercise("first", Difficulty::Basic),
            exercise("skipped", Difficulty::Advanced),
            exercise("second", Difficulty::Intermediate),
            exercise("third", Difficulty::Basic),
        ];
        let cfg = SessionConfig {
            difficulties: vec![Difficulty::Basic, Difficulty::Intermediate],
            ..config(1)
        };

        let session = runner
            .run("m", &cfg, &exercises, CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<&str> = session.results.iter().map(|r| r.exercise.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        // "second" got the extraction failure then passed on its retry
        assert_eq!(session.results[1].attempts_used, 2);
        assert_eq!(session.stats.passed, 3);
        assert_eq!(session.stats.total_attempts, 4);
        assert!(session.is_complete());
        assert_eq!(session.recompute_stats(), session.stats);
    }

    #[tokio::test]
    async fn test_concurrent_run_records_every_exercise() {
        if !python_available() {
            return;
        }
        let client = Arc::new(ScriptedClient::new([GOOD; 4]));
        let runner = SessionRunner::new(client);
        let exercises: Vec<_> = (0..4)
            .map(|i| exercise(&format!("ex{i}"), Difficulty::Basic))
            .collect();

        let session = runner
            .run("m", &config(3), &exercises, CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<&str> = session.results.iter().map(|r| r.exercise.name.as_str()).collect();
        assert_eq!(names, ["ex0", "ex1", "ex2", "ex3"]);
        assert_eq!(session.stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_honoured() {
        if !python_available() {
            return;
        }
        let client = Arc::new(SlowClient::new(Duration::from_millis(100), GOOD));
        let runner = SessionRunner::new(client.clone());
        let exercises: Vec<_> = (0..6)
            .map(|i| exercise(&format!("ex{i}"), Difficulty::Basic))
            .collect();

        let session = runner
            .run("m", &config(2), &exercises, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.results.len(), 6);
        assert_eq!(client.calls(), 6);
        assert_eq!(client.peak(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_request_seals_session_promptly() {
        if !python_available() {
            return;
        }
        let client = Arc::new(SlowClient::new(Duration::from_secs(30), GOOD));
        let runner = SessionRunner::new(client.clone());
        let exercises = [exercise("a", Difficulty::Basic), exercise("b", Difficulty::Basic)];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let session = runner
            .run("m", &config(1), &exercises, cancel)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(session.termination, Termination::Cancelled);
        assert!(session.results.is_empty());
        assert_eq!(session.incomplete, ["a", "b"]);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_aborts_with_partial_session() {
        if !python_available() {
            return;
        }
        let client = Arc::new(ScriptedClient::with_results([
            Ok(GOOD.to_string()),
            Err(ModelError::Fatal("model not found".into())),
        ]));
        let runner = SessionRunner::new(client.clone());
        let exercises = [
            exercise("a", Difficulty::Basic),
            exercise("b", Difficulty::Basic),
            exercise("c", Difficulty::Basic),
        ];

        let err = runner
            .run("m", &config(1), &exercises, CancellationToken::new())
            .await
            .unwrap_err();

        let partial = err.partial_session().expect("partial session");
        assert_eq!(partial.results.len(), 1);
        assert_eq!(partial.incomplete, ["b", "c"]);
        assert!(matches!(partial.termination, Termination::Aborted { .. }));
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_sealed() {
        if !python_available() {
            return;
        }
        let client = Arc::new(ScriptedClient::new([GOOD]));
        let runner = SessionRunner::new(client);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = runner
            .run("m", &config(1), &[exercise("a", Difficulty::Basic)], cancel)
            .await
            .unwrap();

        assert_eq!(session.termination, Termination::Cancelled);
        assert!(session.results.is_empty());
        assert_eq!(session.incomplete, ["a"]);
    }

    #[tokio::test]
    async fn test_events_end_with_done() {
        if !python_available() {
            return;
        }
        let (tx, mut rx) = mpsc::channel(64);
        let runner = SessionRunner::new(Arc::new(ScriptedClient::new([GOOD]))).with_events(tx);

        runner
            .run("m", &config(1), &[exercise("a", Difficulty::Basic)], CancellationToken::new())
            .await
            .unwrap();
        drop(runner);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(SessionEvent::SessionStarted { exercises: 1, .. })));
        assert!(matches!(events.last(), Some(SessionEvent::Done { stats }) if stats.passed == 1));

        let json = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(json["type"], "exercise_started");
    }
}
