use std::sync::Arc;
use std::time::{Duration, Instant};

use retrybench_core::{
    AttemptError, AttemptErrorKind, AttemptOutcome, CaseOutcome, ExerciseDefinition, TestCase,
};
use tracing::debug;

use crate::executor::{self, CallOutcome, ExecutorError, LoadOutcome, PythonWorker, WorkerSandbox};
use crate::validator::ValidatorRegistry;

pub const DEFAULT_INTERPRETER: &str = "python3";

/// Prefix of the error recorded for cases skipped after a failed load.
pub(crate) const NOT_RUN: &str = "not run: ";

/// Executes candidate code against every test case of an exercise.
#[derive(Debug, Clone)]
pub struct TestCaseRunner {
    validators: Arc<ValidatorRegistry>,
    interpreter: String,
}

impl Default for TestCaseRunner {
    fn default() -> Self {
        Self::new(Arc::new(ValidatorRegistry::default()))
    }
}

impl TestCaseRunner {
    pub fn new(validators: Arc<ValidatorRegistry>) -> Self {
        Self {
            validators,
            interpreter: DEFAULT_INTERPRETER.to_string(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    pub async fn check_interpreter(&self) -> Result<String, ExecutorError> {
        executor::probe_interpreter(&self.interpreter).await
    }

    /// Loads `code` in a fresh worker and evaluates every test case.
    ///
    /// A timed-out or crashed worker is replaced before the next case, so one
    /// hang does not hide the remaining results.
    pub async fn run(
        &self,
        code: &str,
        exercise: &ExerciseDefinition,
        timeout: Duration,
    ) -> AttemptOutcome {
        let sandbox = match WorkerSandbox::prepare(code, &self.interpreter) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let error = AttemptError::new(AttemptErrorKind::Execution, e.to_string());
                return AttemptOutcome::errored(error, not_run(exercise, 0, "sandbox unavailable"));
            }
        };

        let mut cases = Vec::with_capacity(exercise.test_cases.len());
        let mut worker: Option<PythonWorker> = None;

        for (index, case) in exercise.test_cases.iter().enumerate() {
            let mut active = match worker.take() {
                Some(w) => w,
                None => match self.load(&sandbox, exercise, timeout).await {
                    Ok(w) => w,
                    Err(error) => {
                        cases.extend(not_run(exercise, index, &error.message));
                        return AttemptOutcome::errored(error, cases);
                    }
                },
            };

            let started = Instant::now();
            let call = active.call(case, timeout).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            let reusable = matches!(call, CallOutcome::Returned(_) | CallOutcome::Raised(_));
            let outcome = self.judge(exercise, index, case, call, timeout, duration_ms);
            debug!(
                exercise = %exercise.name,
                case = index + 1,
                passed = outcome.passed,
                "Test case evaluated"
            );
            cases.push(outcome);

            match reusable {
                true => worker = Some(active),
                false => active.shutdown().await,
            }
        }

        if let Some(w) = worker {
            w.shutdown().await;
        }
        classify(exercise, cases)
    }

    async fn load(
        &self,
        sandbox: &WorkerSandbox,
        exercise: &ExerciseDefinition,
        timeout: Duration,
    ) -> Result<PythonWorker, AttemptError> {
        let outcome = sandbox
            .spawn(&exercise.function_name, timeout)
            .await
            .map_err(|e| AttemptError::new(AttemptErrorKind::Execution, e.to_string()))?;

        match outcome {
            LoadOutcome::Ready(worker) => Ok(worker),
            LoadOutcome::LoadError(error) => {
                Err(AttemptError::new(AttemptErrorKind::Execution, error))
            }
            LoadOutcome::MissingFunction { defined } => {
                let found = match defined.is_empty() {
                    true => "nothing callable was defined".to_string(),
                    false => format!("defined: {}", defined.join(", ")),
                };
                Err(AttemptError::new(
                    AttemptErrorKind::MissingFunction,
                    format!("function '{}' is not defined ({found})", exercise.function_name),
                ))
            }
            LoadOutcome::TimedOut => Err(AttemptError::new(
                AttemptErrorKind::Timeout,
                format!("loading the code took longer than {} ms", timeout.as_millis()),
            )),
        }
    }

    fn judge(
        &self,
        exercise: &ExerciseDefinition,
        index: usize,
        case: &TestCase,
        call: CallOutcome,
        timeout: Duration,
        duration_ms: f64,
    ) -> CaseOutcome {
        let (actual, passed, error, timed_out) = match call {
            CallOutcome::Returned(actual) => {
                let passed = self
                    .validators
                    .check(exercise.policy_for(case), &actual, &case.expected);
                (Some(actual), passed, None, false)
            }
            CallOutcome::Raised(error) | CallOutcome::Crashed(error) => {
                (None, false, Some(error), false)
            }
            CallOutcome::TimedOut => {
                let error = format!("timed out after {} ms", timeout.as_millis());
                (None, false, Some(error), true)
            }
        };

        CaseOutcome {
            index,
            args: case.args.clone(),
            expected: case.expected.clone(),
            actual,
            passed,
            error,
            timed_out,
            duration_ms,
        }
    }
}

fn not_run(exercise: &ExerciseDefinition, from: usize, reason: &str) -> Vec<CaseOutcome> {
    exercise
        .test_cases
        .iter()
        .enumerate()
        .skip(from)
        .map(|(index, case)| {
            CaseOutcome::errored(
                index,
                case.args.clone(),
                case.expected.clone(),
                format!("{NOT_RUN}{reason}"),
            )
        })
        .collect()
}

/// ERROR when any case raised or timed out, the first such case naming the
/// error kind; otherwise PASSED or FAILED by comparison.
fn classify(exercise: &ExerciseDefinition, cases: Vec<CaseOutcome>) -> AttemptOutcome {
    let first_error = cases.iter().find_map(|c| {
        let message = c.error.as_ref()?;
        let kind = match c.timed_out {
            true => AttemptErrorKind::Timeout,
            false => AttemptErrorKind::Execution,
        };
        let call = exercise
            .test_cases
            .get(c.index)
            .map(|t| t.render_call(&exercise.function_name))
            .unwrap_or_else(|| format!("test case {}", c.index + 1));
        Some(AttemptError::new(kind, format!("{call}: {message}")))
    });

    match first_error {
        Some(error) => AttemptOutcome::errored(error, cases),
        None => AttemptOutcome::compared(cases),
    }
}
