use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attempt::{Classification, ExerciseResult};
use crate::config::SessionConfig;
use crate::exercise::Difficulty;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    Cancelled,
    Aborted { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifficultyStats {
    pub total: u32,
    pub passed: u32,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    /// Fraction in `[0, 1]`.
    pub success_rate: f64,
    pub per_difficulty: BTreeMap<Difficulty, DifficultyStats>,
    pub total_attempts: u32,
    pub average_attempts: f64,
    /// Mean index of the passing attempt among passed exercises.
    pub mean_attempts_to_pass: Option<f64>,
    /// Passing attempt index -> number of exercises that passed on it.
    pub attempts_to_pass: BTreeMap<u32, u32>,
    pub total_time_ms: f64,
}

fn rate(part: u32, whole: u32) -> f64 {
    match whole {
        0 => 0.0,
        n => part as f64 / n as f64,
    }
}

impl SessionStats {
    /// Pure function of the results, so a deserialized session reproduces
    /// the stats it was saved with.
    pub fn from_results(results: &[ExerciseResult], total_time_ms: f64) -> Self {
        let count = |status: Classification| {
            results.iter().filter(|r| r.final_status == status).count() as u32
        };
        let total = results.len() as u32;
        let passed = count(Classification::Passed);

        let mut per_difficulty: BTreeMap<Difficulty, DifficultyStats> = BTreeMap::new();
        for result in results {
            let entry = per_difficulty.entry(result.exercise.difficulty).or_default();
            entry.total += 1;
            entry.passed += result.passed() as u32;
        }
        for stats in per_difficulty.values_mut() {
            stats.success_rate = rate(stats.passed, stats.total);
        }

        let mut attempts_to_pass = BTreeMap::new();
        for index in results.iter().filter_map(ExerciseResult::attempts_to_pass) {
            *attempts_to_pass.entry(index).or_insert(0u32) += 1;
        }
        let mean_attempts_to_pass = match passed {
            0 => None,
            n => {
                let sum: u32 = attempts_to_pass.iter().map(|(idx, cnt)| idx * cnt).sum();
                Some(sum as f64 / n as f64)
            }
        };

        let total_attempts: u32 = results.iter().map(|r| r.attempts_used).sum();

        Self {
            total,
            passed,
            failed: count(Classification::Failed),
            errors: count(Classification::Error),
            success_rate: rate(passed, total),
            per_difficulty,
            total_attempts,
            average_attempts: match total {
                0 => 0.0,
                n => total_attempts as f64 / n as f64,
            },
            mean_attempts_to_pass,
            attempts_to_pass,
            total_time_ms,
        }
    }
}

/// Finalized, serializable record of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSession {
    pub id: Uuid,
    pub model: String,
    pub config: SessionConfig,
    pub results: Vec<ExerciseResult>,
    pub stats: SessionStats,
    pub started_at: i64,
    pub finished_at: i64,
    pub termination: Termination,
    /// Exercises that never reached a terminal state.
    #[serde(default)]
    pub incomplete: Vec<String>,
}

impl BenchmarkSession {
    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Completed
    }

    pub fn recompute_stats(&self) -> SessionStats {
        SessionStats::from_results(&self.results, self.stats.total_time_ms)
    }
}
