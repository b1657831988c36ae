use std::path::{Path, PathBuf};

use retrybench_core::{BenchmarkSession, Result};

/// Persists a sealed session somewhere.
pub trait ReportWriter {
    fn write(&self, session: &BenchmarkSession) -> Result<PathBuf>;
}

/// Writes `benchmark_results_<model>_<unix seconds>.json` into a directory.
#[derive(Debug, Clone)]
pub struct JsonReportWriter {
    dir: PathBuf,
}

impl JsonReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn file_name(session: &BenchmarkSession) -> String {
        let model: String = session
            .model
            .chars()
            .map(|c| match c {
                '/' | ':' | '\\' | ' ' => '_',
                c => c,
            })
            .collect();
        format!("benchmark_results_{}_{}.json", model, session.started_at / 1000)
    }
}

impl ReportWriter for JsonReportWriter {
    fn write(&self, session: &BenchmarkSession) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::file_name(session));
        let json = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, json)?;
        tracing::info!("Results saved to {:?}", path);
        Ok(path)
    }
}

pub fn load_report(path: &Path) -> Result<BenchmarkSession> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{ResultAggregator, RunMetadata};
    use retrybench_core::{SessionConfig, Termination};
    use uuid::Uuid;

    fn session(model: &str) -> BenchmarkSession {
        ResultAggregator::new().finalize(
            &SessionConfig::default(),
            RunMetadata {
                id: Uuid::new_v4(),
                model: model.into(),
                started_at: 1_700_000_000_123,
                finished_at: 1_700_000_009_000,
                total_time_ms: 8877.0,
            },
            Termination::Aborted {
                reason: "fatal model error: gone".into(),
            },
        )
    }

    #[test]
    fn test_file_name_is_path_safe() {
        assert_eq!(
            JsonReportWriter::file_name(&session("library/qwen2.5:7b")),
            "benchmark_results_library_qwen2.5_7b_1700000000.json"
        );
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonReportWriter::new(dir.path().join("out"));
        let original = session("llama3:8b");

        let path = writer.write(&original).unwrap();
        assert!(path.starts_with(dir.path().join("out")));

        let loaded = load_report(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.recompute_stats(), loaded.stats);
    }
}
