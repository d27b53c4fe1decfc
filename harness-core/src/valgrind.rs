//! Valgrind log verification.
//!
//! After collection, every `*-valgrind-*.log` gathered by the run must
//! carry an `ERROR SUMMARY` line. A missing summary means valgrind never
//! finalized the log and fails immediately; non-zero error counts are
//! collected across all files and reported once the scan is complete.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::Span;

use crate::error::{Result, VerificationError};

/// Per-file verification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValgrindReport {
    /// Log file name.
    pub file: String,
    /// Whether an `ERROR SUMMARY` line was found.
    pub summary_found: bool,
    /// Total reported error count; `None` if a summary line could not be parsed.
    pub error_count: Option<u64>,
}

impl ValgrindReport {
    /// True if a summary exists and reports zero errors.
    pub fn is_clean(&self) -> bool {
        self.summary_found && self.error_count == Some(0)
    }
}

fn log_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.+-valgrind-.+\.log$").expect("Static regex pattern should always compile")
    })
}

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"ERROR SUMMARY: (\d+) errors")
            .expect("Static regex pattern should always compile")
    })
}

/// Whether a file name looks like a valgrind log.
pub fn is_valgrind_log(file_name: &str) -> bool {
    log_name_pattern().is_match(file_name)
}

/// Parse the contents of one log file.
pub fn parse_valgrind_log(file_name: &str, contents: &str) -> ValgrindReport {
    let mut summary_found = false;
    let mut error_count = Some(0u64);

    for line in contents.lines().filter(|l| l.contains("ERROR SUMMARY")) {
        summary_found = true;
        let count = summary_pattern()
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        error_count = match (error_count, count) {
            (Some(total), Some(n)) => total.checked_add(n),
            _ => None,
        };
    }

    ValgrindReport {
        file: file_name.to_string(),
        summary_found,
        error_count: if summary_found { error_count } else { None },
    }
}

/// Verify every valgrind log in `dir`.
///
/// # Errors
///
/// - [`VerificationError::MissingSummary`] as soon as a log without a summary is found
/// - [`VerificationError::MemoryErrors`] after the scan if any log reported errors
pub fn verify_valgrind_logs(dir: &Path) -> Result<Vec<ValgrindReport>> {
    let span = Span::current();
    tracing::debug!(parent: &span, "Checking valgrind logs in {}", dir.display());

    let files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    verify_collected_logs(dir, &files, &span)
}

/// Verify the given log files, gathered into `dir` by the current run.
///
/// Files whose names don't look like valgrind logs are skipped, so stale logs
/// left in `dir` by earlier runs never affect the result. Errors are reported
/// like [`verify_valgrind_logs`].
pub fn verify_collected_logs(
    dir: &Path,
    files: &[PathBuf],
    span: &Span,
) -> Result<Vec<ValgrindReport>> {
    let mut files: Vec<(String, &PathBuf)> = files
        .iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            is_valgrind_log(&name).then_some((name, path))
        })
        .collect();
    files.sort();

    let mut reports = Vec::with_capacity(files.len());
    let mut failed = Vec::new();

    for (name, path) in files {
        let bytes = std::fs::read(path)?;
        let report = parse_valgrind_log(&name, &String::from_utf8_lossy(&bytes));

        if !report.summary_found {
            tracing::error!(parent: span, "Valgrind log {} does not contain summary", name);
            return Err(VerificationError::MissingSummary { file: name }.into());
        }
        if !report.is_clean() {
            tracing::error!(parent: span, "Valgrind errors found in {}", name);
            failed.push(name);
        }
        reports.push(report);
    }

    if !failed.is_empty() {
        return Err(VerificationError::MemoryErrors {
            dir: dir.to_path_buf(),
            files: failed,
        }
        .into());
    }

    tracing::info!(parent: span, "{} valgrind logs verified clean", reports.len());
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;

    const CLEAN: &str = "==12== Memcheck\n==12== ERROR SUMMARY: 0 errors from 0 contexts (suppressed: 0 from 0)\n";
    const DIRTY: &str = "==13== Invalid read of size 4\n==13== ERROR SUMMARY: 3 errors from 2 contexts (suppressed: 0 from 0)\n";
    const UNFINISHED: &str = "==14== Memcheck, a memory error detector\n==14== Command: /usr/libexec/bluechi-agent\n";

    #[test]
    fn log_name_matching() {
        assert!(is_valgrind_log("ctrl-1-bluechi-controller-valgrind-77.log"));
        assert!(is_valgrind_log("a-valgrind-b.log"));
        assert!(!is_valgrind_log("-valgrind-b.log"));
        assert!(!is_valgrind_log("journal-node-foo.log"));
        assert!(!is_valgrind_log("a-valgrind-b.log.gz"));
    }

    #[test]
    fn parse_clean_log() {
        let report = parse_valgrind_log("a-valgrind-1.log", CLEAN);
        assert!(report.summary_found);
        assert_eq!(report.error_count, Some(0));
        assert!(report.is_clean());
    }

    #[test]
    fn parse_dirty_log() {
        let report = parse_valgrind_log("a-valgrind-1.log", DIRTY);
        assert_eq!(report.error_count, Some(3));
        assert!(!report.is_clean());
    }

    #[test]
    fn parse_unfinished_log() {
        let report = parse_valgrind_log("a-valgrind-1.log", UNFINISHED);
        assert!(!report.summary_found);
        assert_eq!(report.error_count, None);
    }

    #[test]
    fn unparseable_summary_is_not_clean() {
        let report = parse_valgrind_log("a-valgrind-1.log", "ERROR SUMMARY: lots\n");
        assert!(report.summary_found);
        assert_eq!(report.error_count, None);
        assert!(!report.is_clean());
    }

    #[test]
    fn overflowing_error_count_is_not_clean() {
        let contents = "==1== ERROR SUMMARY: 18446744073709551615 errors from 1 contexts\n\
                        ==1== ERROR SUMMARY: 1 errors from 1 contexts\n";
        let report = parse_valgrind_log("a-valgrind-1.log", contents);
        assert!(report.summary_found);
        assert_eq!(report.error_count, None);
        assert!(!report.is_clean());
    }

    #[test]
    fn overflowing_log_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a-valgrind-1.log"),
            "ERROR SUMMARY: 18446744073709551615 errors\nERROR SUMMARY: 1 errors\n",
        )
        .unwrap();

        let err = verify_valgrind_logs(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Verification(VerificationError::MemoryErrors { .. })
        ));
    }

    #[test]
    fn collected_logs_ignore_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old-valgrind-1.log"), DIRTY).unwrap();
        let fresh = dir.path().join("new-valgrind-2.log");
        std::fs::write(&fresh, CLEAN).unwrap();
        let journal = dir.path().join("journal-new.log");
        std::fs::write(&journal, "no summary here").unwrap();

        let reports = verify_collected_logs(dir.path(), &[fresh, journal], &Span::none()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].file, "new-valgrind-2.log");
    }

    #[test]
    fn clean_directory_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ctrl-bluechi-controller-valgrind-1.log"), CLEAN).unwrap();
        std::fs::write(dir.path().join("node-bluechi-agent-valgrind-2.log"), CLEAN).unwrap();
        std::fs::write(dir.path().join("journal-ctrl.log"), "no summary here").unwrap();

        let reports = verify_valgrind_logs(dir.path()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(ValgrindReport::is_clean));
    }

    #[test]
    fn missing_summary_names_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("node-bluechi-agent-valgrind-2.log"), UNFINISHED).unwrap();

        let err = verify_valgrind_logs(dir.path()).unwrap_err();
        match err {
            HarnessError::Verification(VerificationError::MissingSummary { file }) => {
                assert_eq!(file, "node-bluechi-agent-valgrind-2.log");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn errors_reported_after_full_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-valgrind-1.log"), DIRTY).unwrap();
        std::fs::write(dir.path().join("b-valgrind-1.log"), CLEAN).unwrap();
        std::fs::write(dir.path().join("c-valgrind-1.log"), DIRTY).unwrap();

        let err = verify_valgrind_logs(dir.path()).unwrap_err();
        match err {
            HarnessError::Verification(VerificationError::MemoryErrors { dir: d, files }) => {
                assert_eq!(d, dir.path());
                assert_eq!(files, vec!["a-valgrind-1.log", "c-valgrind-1.log"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_summary_wins_over_later_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-valgrind-1.log"), DIRTY).unwrap();
        std::fs::write(dir.path().join("b-valgrind-1.log"), UNFINISHED).unwrap();

        let err = verify_valgrind_logs(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Verification(VerificationError::MissingSummary { .. })
        ));
    }

    #[test]
    fn empty_directory_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_valgrind_logs(dir.path()).unwrap().is_empty());
    }
}
