use std::collections::HashMap;
use std::sync::Arc;

use retrybench_core::{BenchError, ComparisonPolicy, ExerciseDefinition, Result};
use serde_json::{Number, Value};

/// Decides whether an actual return value is acceptable for the expected one.
pub trait Validator: Send + Sync {
    fn validate(&self, actual: &Value, expected: &Value) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&Value, &Value) -> bool + Send + Sync,
{
    fn validate(&self, actual: &Value, expected: &Value) -> bool {
        self(actual, expected)
    }
}

/// Structural equality where `5 == 5.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Validator for ExactMatch {
    fn validate(&self, actual: &Value, expected: &Value) -> bool {
        values_equal(actual, expected)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub epsilon: f64,
}

impl Validator for Tolerance {
    fn validate(&self, actual: &Value, expected: &Value) -> bool {
        within(actual, expected, self.epsilon)
    }
}

/// Top-level lists compare as multisets; anything else falls back to exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unordered;

impl Validator for Unordered {
    fn validate(&self, actual: &Value, expected: &Value) -> bool {
        let (Value::Array(actual), Value::Array(expected)) = (actual, expected) else {
            return values_equal(actual, expected);
        };
        if actual.len() != expected.len() {
            return false;
        }

        let mut used = vec![false; actual.len()];
        expected.iter().all(|want| {
            let slot = actual
                .iter()
                .enumerate()
                .position(|(i, got)| !used[i] && values_equal(got, want));
            match slot {
                Some(i) => {
                    used[i] = true;
                    true
                }
                None => false,
            }
        })
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub(crate) fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => actual == expected,
    }
}

fn within(actual: &Value, expected: &Value, epsilon: f64) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= epsilon,
            _ => false,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| within(x, y, epsilon))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| within(v, w, epsilon)))
        }
        _ => actual == expected,
    }
}

/// Built-in comparison policies plus caller-registered validators.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    custom: HashMap<String, Arc<dyn Validator>>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("ValidatorRegistry")
            .field("custom", &names)
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, validator: impl Validator + 'static) {
        self.custom.insert(name.into(), Arc::new(validator));
    }

    pub fn with(mut self, name: impl Into<String>, validator: impl Validator + 'static) -> Self {
        self.register(name, validator);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Unknown custom validators never pass; `validate_exercise` rejects
    /// them before a session starts.
    pub fn check(&self, policy: &ComparisonPolicy, actual: &Value, expected: &Value) -> bool {
        match policy {
            ComparisonPolicy::Exact => ExactMatch.validate(actual, expected),
            ComparisonPolicy::Tolerance { epsilon } => {
                Tolerance { epsilon: *epsilon }.validate(actual, expected)
            }
            ComparisonPolicy::Unordered => Unordered.validate(actual, expected),
            ComparisonPolicy::Custom { validator } => match self.custom.get(validator) {
                Some(v) => v.validate(actual, expected),
                None => {
                    tracing::warn!("No validator registered under '{}'", validator);
                    false
                }
            },
        }
    }

    pub fn validate_exercise(&self, exercise: &ExerciseDefinition) -> Result<()> {
        let missing = exercise.policies().find_map(|policy| match policy {
            ComparisonPolicy::Custom { validator } if !self.contains(validator) => Some(validator),
            _ => None,
        });
        match missing {
            Some(name) => Err(BenchError::config(format!(
                "exercise '{}' uses unknown validator '{}'",
                exercise.name, name
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrybench_core::{Difficulty, TestCase};
    use serde_json::json;

    #[test]
    fn test_exact_uses_numeric_semantics() {
        assert!(ExactMatch.validate(&json!(5.0), &json!(5)));
        assert!(ExactMatch.validate(&json!([1, 2.0, {"a": 3}]), &json!([1.0, 2, {"a": 3.0}])));
        assert!(!ExactMatch.validate(&json!(5.1), &json!(5)));
        assert!(!ExactMatch.validate(&json!("5"), &json!(5)));
        assert!(!ExactMatch.validate(&json!(true), &json!(1)));
        assert!(!ExactMatch.validate(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_tolerance() {
        let v = Tolerance { epsilon: 1e-6 };
        assert!(v.validate(&json!(0.30000000000000004), &json!(0.3)));
        assert!(v.validate(&json!([1.0000001, 2]), &json!([1, 2])));
        assert!(!v.validate(&json!(1.01), &json!(1)));
        assert!(!v.validate(&json!([1]), &json!([1, 2])));
    }

    #[test]
    fn test_unordered_is_a_multiset_comparison() {
        assert!(Unordered.validate(&json!([3, 1, 2]), &json!([1, 2, 3])));
        assert!(Unordered.validate(&json!([[1, 2], [0]]), &json!([[0], [1, 2]])));
        assert!(!Unordered.validate(&json!([1, 1, 2]), &json!([1, 2, 2])));
        assert!(!Unordered.validate(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(Unordered.validate(&json!(4), &json!(4.0)));
    }

    #[test]
    fn test_registry_dispatches_custom_closures() {
        let registry = ValidatorRegistry::new().with("case_insensitive", |a: &Value, e: &Value| {
            match (a.as_str(), e.as_str()) {
                (Some(a), Some(e)) => a.eq_ignore_ascii_case(e),
                _ => false,
            }
        });
        let policy = ComparisonPolicy::Custom {
            validator: "case_insensitive".into(),
        };

        assert!(registry.check(&policy, &json!("HeLLo"), &json!("hello")));
        assert!(!registry.check(&policy, &json!("world"), &json!("hello")));

        let unknown = ComparisonPolicy::Custom { validator: "nope".into() };
        assert!(!registry.check(&unknown, &json!(1), &json!(1)));
    }

    #[test]
    fn test_validate_exercise_rejects_unknown_validator() {
        let exercise = ExerciseDefinition::new(
            "Shout",
            "Upper-case a string.",
            Difficulty::Basic,
            "shout",
            vec![TestCase::new(vec![json!("a")], json!("A"))],
        )
        .with_comparison(ComparisonPolicy::Custom { validator: "loose".into() });

        let err = ValidatorRegistry::new().validate_exercise(&exercise).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));

        let registry = ValidatorRegistry::new().with("loose", |_: &Value, _: &Value| true);
        assert!(registry.validate_exercise(&exercise).is_ok());
    }
}
