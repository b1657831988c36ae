use retrybench_core::{AttemptErrorKind, AttemptRecord, CaseOutcome, ExerciseDefinition};

use crate::runner::NOT_RUN;

const MAX_LISTED_MISMATCHES: usize = 10;
const MAX_VALUE_CHARS: usize = 300;

pub const SYSTEM_PROMPT: &str = "You are an expert Python programmer solving coding exercises. \
Reply with exactly one ```python code block containing the complete solution. \
Define the requested function or class with exactly the name given. \
Return results instead of printing them, and do not read input or include example usage.";

/// Longest prefix of `text` that is at most `max` bytes and ends on a char boundary.
pub(crate) fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn shorten(text: &str) -> String {
    match clip(text, MAX_VALUE_CHARS) {
        clipped if clipped.len() < text.len() => format!("{clipped}..."),
        whole => whole.to_string(),
    }
}

pub fn initial_prompt(exercise: &ExerciseDefinition) -> String {
    let signature = match &exercise.signature {
        Some(sig) => format!("\n- Use this signature: `{sig}`"),
        None => String::new(),
    };

    format!(
        "Solve this coding problem in Python.

Problem: {description}

Requirements:
- The solution must define `{name}`{signature}
- Return the result; do not print it and do not read input
- Use only the Python standard library
- Answer with a single ```python code block",
        description = exercise.description,
        name = exercise.function_name,
    )
}

fn mismatch_lines(exercise: &ExerciseDefinition, mismatches: &[&CaseOutcome]) -> Vec<String> {
    let mut lines: Vec<String> = mismatches
        .iter()
        .take(MAX_LISTED_MISMATCHES)
        .map(|case| {
            let call = exercise
                .test_cases
                .get(case.index)
                .map(|t| t.render_call(&exercise.function_name))
                .unwrap_or_else(|| format!("test case {}", case.index + 1));
            let actual = case
                .actual
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "nothing".to_string());
            format!(
                "- {}: expected {}, but got {}",
                shorten(&call),
                shorten(&case.expected.to_string()),
                shorten(&actual)
            )
        })
        .collect();
    if mismatches.len() > MAX_LISTED_MISMATCHES {
        lines.push(format!(
            "- ... and {} more",
            mismatches.len() - MAX_LISTED_MISMATCHES
        ));
    }
    lines
}

/// What went wrong in `record`, in the words sent back to the model.
///
/// An error comes first; wrong results from the cases that did return are
/// listed after it.
pub fn failure_summary(exercise: &ExerciseDefinition, record: &AttemptRecord) -> String {
    let mismatches: Vec<&CaseOutcome> = record.cases.iter().filter(|c| c.is_mismatch()).collect();
    let total = record.cases.len();

    let Some(error) = &record.error else {
        return format!(
            "{} of {} test cases failed:\n{}",
            mismatches.len(),
            total,
            mismatch_lines(exercise, &mismatches).join("\n")
        );
    };

    let mut parts = vec![match error.kind {
        AttemptErrorKind::Extraction => format!(
            "Your reply did not contain a code block defining `{}`.",
            exercise.function_name
        ),
        AttemptErrorKind::MissingFunction => format!(
            "The code ran but `{}` was not defined: {}",
            exercise.function_name, error.message
        ),
        AttemptErrorKind::Timeout => format!(
            "Execution timed out: {}. Check for infinite loops or exponential recursion.",
            shorten(&error.message)
        ),
        AttemptErrorKind::Execution => format!("Error: {}", shorten(&error.message)),
    }];

    let other_errors = record
        .cases
        .iter()
        .filter(|c| c.error.as_deref().is_some_and(|e| !e.starts_with(NOT_RUN)))
        .count()
        .saturating_sub(1);
    if other_errors > 0 {
        parts.push(format!(
            "{other_errors} more test case(s) also raised an error or timed out."
        ));
    }
    if !mismatches.is_empty() {
        parts.push(format!(
            "{} of {} test cases returned a wrong result:\n{}",
            mismatches.len(),
            total,
            mismatch_lines(exercise, &mismatches).join("\n")
        ));
    }
    parts.join("\n")
}

pub fn feedback_prompt(exercise: &ExerciseDefinition, record: &AttemptRecord) -> String {
    let previous = match &record.code {
        Some(code) => format!("\n\nYour previous code:\n```python\n{code}\n```"),
        None => String::new(),
    };

    format!(
        "Your previous solution failed. Here's what went wrong:
{summary}

Problem: {description}{previous}

Please fix the issue and reply with the corrected code in a single ```python code block.",
        summary = failure_summary(exercise, record),
        description = exercise.description,
    )
}
