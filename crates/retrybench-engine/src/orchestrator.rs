use std::sync::Arc;
use std::time::Instant;

use retrybench_core::{
    AttemptError, AttemptErrorKind, AttemptOutcome, AttemptRecord, ExerciseDefinition,
    ExerciseResult, ModelError, SessionConfig, Transcript,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::ModelClient;
use crate::extractor::extract;
use crate::prompt::{feedback_prompt, initial_prompt, SYSTEM_PROMPT};
use crate::runner::TestCaseRunner;
use crate::session::SessionEvent;

pub enum ExerciseOutcome {
    Finished(ExerciseResult),
    /// Stopped before reaching a terminal state; nothing is recorded.
    Cancelled,
}

enum State {
    Init,
    AwaitingCompletion,
    Evaluating { response: String, started: Instant },
    Retry { feedback: String },
    Passed,
    Exhausted,
}

/// Drives one exercise through request, evaluation and feedback until it
/// passes or runs out of attempts.
pub struct RetryOrchestrator {
    client: Arc<dyn ModelClient>,
    runner: TestCaseRunner,
    model: String,
    config: SessionConfig,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl RetryOrchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        runner: TestCaseRunner,
        model: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            runner,
            model: model.into(),
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<mpsc::Sender<SessionEvent>>) -> Self {
        self.events = events;
        self
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// A model failure is returned as-is and never consumed as an attempt.
    pub async fn run_exercise(
        &self,
        exercise: &ExerciseDefinition,
        cancel: &CancellationToken,
    ) -> Result<ExerciseOutcome, ModelError> {
        let mut transcript = Transcript::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut state = State::Init;

        loop {
            state = match state {
                State::Init => {
                    transcript.push_system(SYSTEM_PROMPT);
                    transcript.push_user(initial_prompt(exercise));
                    State::AwaitingCompletion
                }

                State::AwaitingCompletion => {
                    let attempt = attempts.len() as u32 + 1;
                    self.emit(SessionEvent::AttemptStarted {
                        exercise: exercise.name.clone(),
                        attempt,
                    })
                    .await;
                    debug!(exercise = %exercise.name, attempt, "Requesting completion");

                    let started = Instant::now();
                    let reply = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(ExerciseOutcome::Cancelled),
                        reply = self.client.send(
                            &self.model,
                            transcript.messages(),
                            self.config.temperature,
                        ) => reply?,
                    };
                    transcript.push_assistant(reply.clone());
                    State::Evaluating {
                        response: reply,
                        started,
                    }
                }

                State::Evaluating { response, started } => {
                    let index = attempts.len() as u32 + 1;
                    let (code, outcome) = match extract(&response, &exercise.function_name) {
                        Err(failure) => {
                            let error = AttemptError::new(
                                AttemptErrorKind::Extraction,
                                failure.to_string(),
                            );
                            (None, AttemptOutcome::errored(error, Vec::new()))
                        }
                        Ok(extracted) => {
                            let outcome = tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Ok(ExerciseOutcome::Cancelled),
                                outcome = self.runner.run(
                                    &extracted.code,
                                    exercise,
                                    self.config.timeout(),
                                ) => outcome,
                            };
                            (Some(extracted.code), outcome)
                        }
                    };

                    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                    let record = AttemptRecord::new(index, response, code, outcome, duration_ms);
                    info!(
                        "{} attempt {}/{}: {}{}",
                        exercise.name,
                        index,
                        self.config.max_attempts,
                        record.classification,
                        record
                            .error
                            .as_ref()
                            .map(|e| format!(" ({})", e.kind))
                            .unwrap_or_default()
                    );
                    self.emit(SessionEvent::AttemptFinished {
                        exercise: exercise.name.clone(),
                        attempt: index,
                        classification: record.classification,
                        error: record.error.as_ref().map(|e| e.to_string()),
                        passed_cases: record.cases.iter().filter(|c| c.passed).count(),
                        total_cases: exercise.test_cases.len(),
                        duration_ms,
                    })
                    .await;

                    let next = if record.passed() {
                        State::Passed
                    } else if index >= self.config.max_attempts {
                        State::Exhausted
                    } else {
                        State::Retry {
                            feedback: feedback_prompt(exercise, &record),
                        }
                    };
                    attempts.push(record);
                    next
                }

                State::Retry { feedback } => {
                    transcript.push_user(feedback);
                    State::AwaitingCompletion
                }

                State::Passed | State::Exhausted => break,
            };
        }

        let Some(result) =
            ExerciseResult::finalize(exercise.clone(), attempts, transcript.into_messages())
        else {
            return Ok(ExerciseOutcome::Cancelled);
        };
        self.emit(SessionEvent::ExerciseFinished {
            name: exercise.name.clone(),
            status: result.final_status,
            attempts: result.attempts_used,
        })
        .await;
        Ok(ExerciseOutcome::Finished(result))
    }
}
