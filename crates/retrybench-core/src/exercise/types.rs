use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BenchError, Result};

// =============================================================================
// Simple Types (no internal dependencies)
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[serde(alias = "easy")]
    Basic,
    #[serde(alias = "medium")]
    Intermediate,
    #[serde(alias = "hard")]
    Advanced,
    SuperHard,
}

impl Difficulty {
    pub fn label(&self) -> &'static str {
        match self {
            Difficulty::Basic => "Basic",
            Difficulty::Intermediate => "Intermediate",
            Difficulty::Advanced => "Advanced",
            Difficulty::SuperHard => "Super Hard",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Basic => "basic",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
            Difficulty::SuperHard => "super_hard",
        }
    }

    pub fn all() -> &'static [Difficulty] {
        &[
            Difficulty::Basic,
            Difficulty::Intermediate,
            Difficulty::Advanced,
            Difficulty::SuperHard,
        ]
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "basic" | "easy" => Ok(Difficulty::Basic),
            "intermediate" | "medium" => Ok(Difficulty::Intermediate),
            "advanced" | "hard" => Ok(Difficulty::Advanced),
            "super_hard" | "superhard" => Ok(Difficulty::SuperHard),
            other => Err(BenchError::config(format!("unknown difficulty '{other}'"))),
        }
    }
}

/// How an actual return value is compared with the expected one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Structural equality with numeric coercion (`5 == 5.0`).
    #[default]
    Exact,
    /// Numbers may differ by at most `epsilon`, recursively through collections.
    Tolerance { epsilon: f64 },
    /// Top-level lists compare as multisets.
    Unordered,
    /// A validator registered under `validator` by the caller.
    Custom { validator: String },
}

impl ComparisonPolicy {
    fn check(&self) -> std::result::Result<(), String> {
        match self {
            ComparisonPolicy::Tolerance { epsilon } if !epsilon.is_finite() || *epsilon < 0.0 => {
                Err(format!("tolerance must be a finite non-negative number, got {epsilon}"))
            }
            ComparisonPolicy::Custom { validator } if validator.trim().is_empty() => {
                Err("custom comparison needs a validator name".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// One method invocation on an object built from the required callable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// A single input/expected-output pair.
///
/// `args` are passed positionally. When `calls` is present the required
/// callable is treated as a constructor: it is invoked with `args`, every call
/// is applied to the resulting object in order, and the list of their return
/// values is compared against `expected`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub args: Vec<Value>,
    pub expected: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls: Option<Vec<MethodCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonPolicy>,
}

impl TestCase {
    pub fn new(args: Vec<Value>, expected: Value) -> Self {
        Self {
            args,
            expected,
            calls: None,
            comparison: None,
        }
    }

    pub fn with_comparison(mut self, comparison: ComparisonPolicy) -> Self {
        self.comparison = Some(comparison);
        self
    }

    pub fn with_calls(mut self, calls: Vec<MethodCall>) -> Self {
        self.calls = Some(calls);
        self
    }

    /// Python-style rendering of the call, used in feedback and logs.
    pub fn render_call(&self, function_name: &str) -> String {
        let args = self
            .args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let head = format!("{function_name}({args})");

        match &self.calls {
            None => head,
            Some(calls) => {
                let chain = calls
                    .iter()
                    .map(|c| {
                        let args = c.args.iter().map(Value::to_string).collect::<Vec<_>>();
                        format!(".{}({})", c.method, args.join(", "))
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("{head} then {chain}")
            }
        }
    }
}

// =============================================================================
// Types with internal dependencies
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExerciseDefinition {
    pub name: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub comparison: ComparisonPolicy,
}

impl ExerciseDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        difficulty: Difficulty,
        function_name: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            difficulty,
            function_name: function_name.into(),
            signature: None,
            test_cases,
            comparison: ComparisonPolicy::Exact,
        }
    }

    pub fn with_comparison(mut self, comparison: ComparisonPolicy) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// The policy governing `case`: its own override, else the exercise default.
    pub fn policy_for<'a>(&'a self, case: &'a TestCase) -> &'a ComparisonPolicy {
        case.comparison.as_ref().unwrap_or(&self.comparison)
    }

    /// Every policy used by this exercise, overrides included.
    pub fn policies(&self) -> impl Iterator<Item = &ComparisonPolicy> {
        std::iter::once(&self.comparison)
            .chain(self.test_cases.iter().filter_map(|c| c.comparison.as_ref()))
    }

    /// Structural checks run before any model call is made.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> {
            Err(BenchError::config(format!("exercise '{}': {msg}", self.name)))
        };

        if self.name.trim().is_empty() {
            return Err(BenchError::config("exercise with an empty name"));
        }
        if self.description.trim().is_empty() {
            return fail("description is empty".to_string());
        }
        if !is_python_identifier(&self.function_name) {
            return fail(format!(
                "'{}' is not a valid function name",
                self.function_name
            ));
        }
        if self.test_cases.is_empty() {
            return fail("no test cases".to_string());
        }
        for policy in self.policies() {
            if let Err(msg) = policy.check() {
                return fail(msg);
            }
        }
        for (idx, case) in self.test_cases.iter().enumerate() {
            let bad_method = case
                .calls
                .iter()
                .flatten()
                .find(|c| !is_python_identifier(&c.method));
            if let Some(call) = bad_method {
                return fail(format!(
                    "test case {} calls invalid method '{}'",
                    idx + 1,
                    call.method
                ));
            }
        }
        Ok(())
    }
}

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

fn is_python_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic());
    head_ok
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !PYTHON_KEYWORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addition() -> ExerciseDefinition {
        ExerciseDefinition::new(
            "Simple Addition",
            "Add two numbers.",
            Difficulty::Basic,
            "add_numbers",
            vec![TestCase::new(vec![json!(2), json!(3)], json!(5))],
        )
    }

    #[test]
    fn test_difficulty_parsing_accepts_aliases() {
        assert_eq!("super-hard".parse::<Difficulty>().unwrap(), Difficulty::SuperHard);
        assert_eq!("Easy".parse::<Difficulty>().unwrap(), Difficulty::Basic);
        assert!("extreme".parse::<Difficulty>().is_err());
    }

    #[test]
    fn test_difficulty_serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&Difficulty::SuperHard).unwrap(), "\"super_hard\"");
        let parsed: Difficulty = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Difficulty::Intermediate);
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        assert!(addition().validate().is_ok());

        let mut no_cases = addition();
        no_cases.test_cases.clear();
        assert!(no_cases.validate().is_err());

        let mut keyword = addition();
        keyword.function_name = "lambda".to_string();
        assert!(keyword.validate().is_err());

        let negative = addition().with_comparison(ComparisonPolicy::Tolerance { epsilon: -1.0 });
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_case_override_wins_over_exercise_policy() {
        let mut ex = addition().with_comparison(ComparisonPolicy::Unordered);
        ex.test_cases.push(
            TestCase::new(vec![json!(1.0), json!(1.5)], json!(2.5))
                .with_comparison(ComparisonPolicy::Tolerance { epsilon: 1e-9 }),
        );

        assert_eq!(ex.policy_for(&ex.test_cases[0]), &ComparisonPolicy::Unordered);
        assert_eq!(
            ex.policy_for(&ex.test_cases[1]),
            &ComparisonPolicy::Tolerance { epsilon: 1e-9 }
        );
    }

    #[test]
    fn test_render_call() {
        let case = TestCase::new(vec![json!([1, 2]), json!("x")], json!(0));
        assert_eq!(case.render_call("f"), "f([1,2], \"x\")");

        let case = TestCase::new(vec![json!(2)], json!([null, 1])).with_calls(vec![
            MethodCall { method: "put".into(), args: vec![json!(1), json!(1)] },
            MethodCall { method: "get".into(), args: vec![json!(1)] },
        ]);
        assert_eq!(case.render_call("LRUCache"), "LRUCache(2) then .put(1, 1) .get(1)");
    }
}
