//! Verify a directory of valgrind logs.

use anyhow::{Context, Result};
use std::path::Path;

use harness_core::{HarnessError, VerificationError, verify_valgrind_logs};

/// Run the `check-valgrind` command.
pub fn run(dir: &Path) -> Result<()> {
    println!("=== valgrind logs in {} ===", dir.display());
    println!();

    match verify_valgrind_logs(dir) {
        Ok(reports) if reports.is_empty() => {
            println!("No valgrind logs found.");
            Ok(())
        }
        Ok(reports) => {
            for report in &reports {
                println!("  [clean] {}", report.file);
            }
            println!();
            println!("{} logs, no memory errors.", reports.len());
            Ok(())
        }
        Err(HarnessError::Verification(VerificationError::MemoryErrors { files, .. })) => {
            for file in &files {
                println!("  [errors] {}", file);
            }
            anyhow::bail!("memory errors found in {} valgrind logs", files.len())
        }
        Err(e) => Err(e).context("Valgrind verification failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_directory_passes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ctrl-1-bluechi-controller-valgrind-3.log"),
            "==3== ERROR SUMMARY: 0 errors from 0 contexts\n",
        )
        .unwrap();
        assert!(run(dir.path()).is_ok());
    }

    #[test]
    fn dirty_log_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("node-foo-1-bluechi-agent-valgrind-4.log"),
            "==4== ERROR SUMMARY: 5 errors from 2 contexts\n",
        )
        .unwrap();
        let err = run(dir.path()).unwrap_err();
        assert!(err.to_string().contains("1 valgrind logs"));
    }

    #[test]
    fn missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent")).is_err());
    }
}
