// src/exec/error_checker.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};

use super::job::output_files;
use crate::engine::ErrorChecker;
use crate::model::ServiceRecord;

/// Pattern matched (case-insensitively) against job output lines.
pub const DEFAULT_ERROR_PATTERN: &str = r"(?i)(error|exception|segmentation fault|core dumped)";

/// Scans a job's stdout/stderr files for lines that look like errors.
#[derive(Debug, Clone)]
pub struct DefaultErrorChecker {
    pattern: Option<Regex>,
    workspace_root: PathBuf,
}

impl DefaultErrorChecker {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            pattern: Regex::new(DEFAULT_ERROR_PATTERN).ok(),
            workspace_root: workspace_root.into(),
        }
    }

    /// Replace the pattern. An invalid pattern is logged and ignored.
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => self.pattern = Some(re),
            Err(err) => warn!(pattern, error = %err, "invalid error pattern; ignoring"),
        }
        self
    }

    fn scan(&self, path: &Path, found: &mut Vec<String>) {
        let Some(pattern) = &self.pattern else {
            return;
        };
        let Ok(file) = File::open(path) else {
            return;
        };
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            if pattern.is_match(&line) {
                found.push(line);
            }
        }
    }
}

impl ErrorChecker for DefaultErrorChecker {
    fn collect_errors(&self, record: &ServiceRecord) -> Vec<String> {
        let workspace = record
            .workspace
            .clone()
            .unwrap_or_else(|| self.workspace_root.clone());
        let mut found = Vec::new();
        for path in output_files(record, &workspace) {
            self.scan(&path, &mut found);
        }
        if !found.is_empty() {
            debug!(service = %record.label(), lines = found.len(), "error lines in job output");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceId;

    #[test]
    fn finds_error_lines_in_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ServiceRecord::new("align");
        record.id = Some(ServiceId(3));
        record.workspace = Some(dir.path().to_path_buf());

        std::fs::write(dir.path().join("align-3.out"), "ok\nfatal Exception thrown\n").unwrap();
        std::fs::write(dir.path().join("align-3.err"), "Segmentation fault (core dumped)\n")
            .unwrap();

        let errors = DefaultErrorChecker::new("/unused").collect_errors(&record);
        assert_eq!(
            errors,
            vec![
                "fatal Exception thrown".to_string(),
                "Segmentation fault (core dumped)".to_string()
            ]
        );
    }

    #[test]
    fn invalid_pattern_keeps_default() {
        let checker = DefaultErrorChecker::new("/unused").with_pattern("(unclosed");
        assert!(checker.pattern.is_some_and(|re| re.is_match("ERROR: boom")));
    }

    #[test]
    fn missing_files_mean_no_errors() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new("align");
        assert!(
            DefaultErrorChecker::new(dir.path())
                .collect_errors(&record)
                .is_empty()
        );
    }
}
