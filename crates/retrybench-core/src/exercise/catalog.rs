use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Difficulty, ExerciseDefinition};

const BUILTIN_SETS: &[(&str, &str)] = &[
    ("basic.json", include_str!("../../exercises/basic.json")),
    ("intermediate.json", include_str!("../../exercises/intermediate.json")),
    ("advanced.json", include_str!("../../exercises/advanced.json")),
    ("super_hard.json", include_str!("../../exercises/super_hard.json")),
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error in {origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseSet {
    pub name: String,
    pub exercises: Vec<ExerciseDefinition>,
}

fn parse_set(origin: &str, content: &str) -> Result<ExerciseSet, CatalogError> {
    serde_json::from_str(content).map_err(|source| CatalogError::Json {
        origin: origin.to_string(),
        source,
    })
}

pub fn load_exercise_set(path: &Path) -> Result<ExerciseSet, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_set(&path.display().to_string(), &content)
}

/// Loads every `*.json` set in `dir`, ordered by file name.
pub fn load_all_exercise_sets(dir: &Path) -> Result<Vec<ExerciseSet>, CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths.iter().map(|path| load_exercise_set(path)).collect()
}

/// The exercise sets compiled into the binary.
pub fn builtin_exercise_sets() -> Result<Vec<ExerciseSet>, CatalogError> {
    BUILTIN_SETS
        .iter()
        .map(|(origin, content)| parse_set(origin, content))
        .collect()
}

/// Flattens `sets` in order, keeping exercises whose difficulty is in `filter`.
/// Later duplicates of an exercise name are dropped.
pub fn select_exercises(sets: &[ExerciseSet], filter: &[Difficulty]) -> Vec<ExerciseDefinition> {
    let mut seen = HashSet::new();
    sets.iter()
        .flat_map(|set| set.exercises.iter())
        .filter(|ex| filter.contains(&ex.difficulty))
        .filter(|ex| seen.insert(ex.name.clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sets_parse_and_validate() {
        let sets = builtin_exercise_sets().unwrap();
        assert_eq!(sets.len(), 4);

        for set in &sets {
            assert!(!set.exercises.is_empty(), "set {} is empty", set.name);
            for ex in &set.exercises {
                ex.validate().unwrap();
            }
        }
    }

    #[test]
    fn test_builtin_sets_cover_every_difficulty() {
        let sets = builtin_exercise_sets().unwrap();
        for difficulty in Difficulty::all() {
            let selected = select_exercises(&sets, &[*difficulty]);
            assert!(!selected.is_empty(), "no {difficulty} exercises");
            assert!(selected.iter().all(|ex| ex.difficulty == *difficulty));
        }
    }

    #[test]
    fn test_load_all_reads_json_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let set = |name: &str| {
            format!(
                r#"{{"name": "{name}", "exercises": [{{
                    "name": "{name}-ex", "description": "d", "difficulty": "basic",
                    "function_name": "f", "test_cases": [{{"args": [1], "expected": 1}}]
                }}]}}"#
            )
        };
        std::fs::write(dir.path().join("b.json"), set("second")).unwrap();
        std::fs::write(dir.path().join("a.json"), set("first")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sets = load_all_exercise_sets(dir.path()).unwrap();
        let names: Vec<_> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn test_load_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_exercise_set(&path).unwrap_err();
        assert!(matches!(err, CatalogError::Json { .. }));
    }
}
