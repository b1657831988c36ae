mod catalog;
mod types;

pub use catalog::{
    builtin_exercise_sets, load_all_exercise_sets, load_exercise_set, select_exercises,
    CatalogError, ExerciseSet,
};
pub use types::{ComparisonPolicy, Difficulty, ExerciseDefinition, MethodCall, TestCase};
