//! The per-run result table and its persistence.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{AccuracyError, PersistError};
use crate::executor::ExecutionResult;
use crate::metrics::{accuracy_report, AccuracyReport};

use super::dataset::Sample;
use super::provider::ProvidedProgram;

/// One sample's row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Final answer; `None` when the program failed.
    pub answer: Option<String>,
    /// Expected answer from the dataset.
    pub groundtruth: String,
    /// Sample identifier.
    pub id: String,
    /// Grouping key of the sample.
    pub group: Option<String>,
    /// The question.
    pub query: String,
    /// Options offered to the program.
    pub possible_answers: Vec<String>,
    /// Program text as provided, so the run can be replayed.
    pub program: String,
    /// Revision run instead of `program`, if any.
    pub revised_program: Option<String>,
    /// Evidence serialized as indented JSON.
    pub evidence: String,
    /// Reason the program gave.
    pub reason: Option<String>,
    /// Set when the program did not compile.
    pub compile_error: Option<String>,
    /// Set when the program failed while running.
    pub runtime_error: Option<String>,
}

impl ResultRow {
    /// Row for `sample` from its program and execution result.
    #[must_use]
    pub fn new(sample: &Sample, program: &ProvidedProgram, result: ExecutionResult) -> Self {
        let evidence =
            serde_json::to_string_pretty(&result.evidence).unwrap_or_else(|_| result.evidence.to_string());
        Self {
            answer: result.answer,
            groundtruth: sample.groundtruth.clone(),
            id: sample.id.clone(),
            group: sample.group.clone(),
            query: sample.query.clone(),
            possible_answers: sample.possible_answers.clone(),
            program: program.text.clone(),
            revised_program: program.revised.clone(),
            evidence,
            reason: result.reason,
            compile_error: result.compile_error,
            runtime_error: result.runtime_error,
        }
    }
}

/// All rows of one run, in dataset order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    /// Identifier of the run that produced the table.
    pub run_id: Uuid,
    /// When the table was started.
    pub created_at: DateTime<Utc>,
    /// Rows in dataset order.
    pub rows: Vec<ResultRow>,
}

impl Default for ResultTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultTable {
    /// Empty table for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            rows: Vec::new(),
        }
    }

    /// Appends a row.
    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Scores every row collected so far.
    pub fn accuracy(&self) -> Result<AccuracyReport, AccuracyError> {
        let predictions: Vec<Option<String>> = self.rows.iter().map(|r| r.answer.clone()).collect();
        let groundtruths: Vec<String> = self.rows.iter().map(|r| r.groundtruth.clone()).collect();
        let groups: Vec<Option<String>> = self.rows.iter().map(|r| r.group.clone()).collect();
        accuracy_report(&predictions, &groundtruths, &groups)
    }

    /// Writes the table under `<results_dir>/<split>/` and returns the file
    /// path. With `new_file` the name is the next free `results_<n>.json`,
    /// otherwise `results.json` is overwritten.
    pub fn save(&self, results_dir: &Path, split: &str, new_file: bool) -> Result<PathBuf, PersistError> {
        let dir = results_dir.join(split);
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = next_results_path(&dir, new_file)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), rows = self.rows.len(), "saved result table");
        Ok(path)
    }

    /// Reads a table written by [`ResultTable::save`].
    pub fn load(path: &Path) -> Result<Self, PersistError> {
        let text = fs::read_to_string(path).map_err(|source| PersistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// `results.json`, or `results_<max + 1>.json` over the numbered files
/// already in `dir` (`results_0.json` when there are none).
pub fn next_results_path(dir: &Path, new_file: bool) -> Result<PathBuf, PersistError> {
    if !new_file {
        return Ok(dir.join("results.json"));
    }
    let entries = fs::read_dir(dir).map_err(|source| PersistError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let next = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let stem = name.to_str()?.strip_suffix(".json")?.strip_prefix("results_")?.to_string();
            stem.parse::<u64>().ok()
        })
        .max()
        .map_or(0, |n| n + 1);
    Ok(dir.join(format!("results_{next}.json")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, answer: Option<&str>, groundtruth: &str) -> ResultRow {
        ResultRow {
            answer: answer.map(str::to_string),
            groundtruth: groundtruth.to_string(),
            id: id.to_string(),
            group: Some("g".to_string()),
            query: "q".to_string(),
            possible_answers: vec!["yes".to_string(), "no".to_string()],
            program: "return 'yes', '', {}".to_string(),
            revised_program: None,
            evidence: "{}".to_string(),
            reason: None,
            compile_error: None,
            runtime_error: None,
        }
    }

    #[test]
    fn numbered_files_continue_from_the_highest() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_results_path(dir.path(), true).unwrap(), dir.path().join("results_0.json"));
        fs::write(dir.path().join("results_3.json"), "{}").unwrap();
        fs::write(dir.path().join("results_x.json"), "{}").unwrap();
        assert_eq!(next_results_path(dir.path(), true).unwrap(), dir.path().join("results_4.json"));
        assert_eq!(next_results_path(dir.path(), false).unwrap(), dir.path().join("results.json"));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = ResultTable::new();
        table.push(row("a", Some("yes"), "yes"));
        table.push(row("b", None, "no"));
        let path = table.save(dir.path(), "val", true).unwrap();
        assert_eq!(path, dir.path().join("val").join("results_0.json"));
        let loaded = ResultTable::load(&path).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn accuracy_over_rows() {
        let mut table = ResultTable::new();
        table.push(row("a", Some("yes"), "yes"));
        table.push(row("b", Some("yes"), "no"));
        let report = table.accuracy().unwrap();
        assert!((report.overall.accuracy - 0.5).abs() < 1e-9);
        assert!(ResultTable::new().accuracy().is_err());
    }
}
