use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exercise::ExerciseDefinition;
use crate::transcript::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Passed,
    Failed,
    Error,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Passed => "PASSED",
            Classification::Failed => "FAILED",
            Classification::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What went wrong in an attempt that did not simply mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    /// No usable code in the model response.
    Extraction,
    /// The code ran but never defined the required callable.
    MissingFunction,
    /// Loading the code or calling into it raised.
    Execution,
    /// Loading or a call exceeded the time bound.
    Timeout,
}

impl fmt::Display for AttemptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptErrorKind::Extraction => "extraction error",
            AttemptErrorKind::MissingFunction => "missing function",
            AttemptErrorKind::Execution => "execution error",
            AttemptErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: AttemptErrorKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: AttemptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one test case within an attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    /// Zero-based position in the exercise's test cases.
    pub index: usize,
    pub args: Vec<Value>,
    pub expected: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: f64,
}

impl CaseOutcome {
    /// A case that never produced a value, either because it raised or
    /// because the worker could not reach it.
    pub fn errored(
        index: usize,
        args: Vec<Value>,
        expected: Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            index,
            args,
            expected,
            actual: None,
            passed: false,
            error: Some(error.into()),
            timed_out: false,
            duration_ms: 0.0,
        }
    }

    /// Returned a value that compared unequal.
    pub fn is_mismatch(&self) -> bool {
        !self.passed && self.error.is_none()
    }
}

/// What the runner reports for one piece of code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub classification: Classification,
    pub cases: Vec<CaseOutcome>,
    pub error: Option<AttemptError>,
}

impl AttemptOutcome {
    pub fn errored(error: AttemptError, cases: Vec<CaseOutcome>) -> Self {
        Self {
            classification: Classification::Error,
            cases,
            error: Some(error),
        }
    }

    /// Every case returned a value; classification follows the comparisons.
    pub fn compared(cases: Vec<CaseOutcome>) -> Self {
        let classification = match cases.iter().all(|c| c.passed) {
            true => Classification::Passed,
            false => Classification::Failed,
        };
        Self {
            classification,
            cases,
            error: None,
        }
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &CaseOutcome> {
        self.cases.iter().filter(|c| c.is_mismatch())
    }

    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|c| c.passed).count()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub index: u32,
    pub response: String,
    pub code: Option<String>,
    pub cases: Vec<CaseOutcome>,
    pub classification: Classification,
    pub error: Option<AttemptError>,
    /// Model request plus evaluation.
    pub duration_ms: f64,
    pub timestamp: i64,
}

impl AttemptRecord {
    pub fn new(
        index: u32,
        response: String,
        code: Option<String>,
        outcome: AttemptOutcome,
        duration_ms: f64,
    ) -> Self {
        Self {
            index,
            response,
            code,
            cases: outcome.cases,
            classification: outcome.classification,
            error: outcome.error,
            duration_ms,
            timestamp: crate::now_millis(),
        }
    }

    pub fn passed(&self) -> bool {
        self.classification == Classification::Passed
    }
}

/// PASSED if any attempt passed, otherwise the classification of the last one.
pub fn final_status_of(attempts: &[AttemptRecord]) -> Option<Classification> {
    if attempts.iter().any(AttemptRecord::passed) {
        return Some(Classification::Passed);
    }
    attempts.last().map(|a| a.classification)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExerciseResult {
    pub exercise: ExerciseDefinition,
    pub attempts: Vec<AttemptRecord>,
    pub final_status: Classification,
    pub attempts_used: u32,
    pub transcript: Vec<Message>,
}

impl ExerciseResult {
    /// Seals a terminal exercise. Returns `None` when no attempt was made.
    pub fn finalize(
        exercise: ExerciseDefinition,
        attempts: Vec<AttemptRecord>,
        transcript: Vec<Message>,
    ) -> Option<Self> {
        let final_status = final_status_of(&attempts)?;
        Some(Self {
            exercise,
            attempts_used: attempts.len() as u32,
            attempts,
            final_status,
            transcript,
        })
    }

    pub fn passed(&self) -> bool {
        self.final_status == Classification::Passed
    }

    /// Index of the passing attempt, if there is one.
    pub fn attempts_to_pass(&self) -> Option<u32> {
        self.attempts.iter().find(|a| a.passed()).map(|a| a.index)
    }

    pub fn total_duration_ms(&self) -> f64 {
        self.attempts.iter().map(|a| a.duration_ms).sum()
    }
}
