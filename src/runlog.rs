use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;

use crate::indexer::types::RunSummary;

/// Append-only text log, one line per completed run. Kept alongside the
/// structured tracing output so operators can eyeball run history
/// without a log pipeline.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, line: &str) -> eyre::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                eyre::eyre!("Failed to open run log '{}': {}", self.path.display(), e)
            })?;
        writeln!(file, "{}", line)
            .map_err(|e| eyre::eyre!("Failed to write run log: {}", e))?;
        Ok(())
    }

    pub fn record_scan(&self, command: &str, summary: &RunSummary) -> eyre::Result<()> {
        self.append(&scan_line(command, summary))
    }
}

pub fn scan_line(command: &str, summary: &RunSummary) -> String {
    format!(
        "{} {} targets={} failed={} blocks={} inserted={} duplicates={} pools_discovered={} elapsed={:.1}s",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        command,
        summary.targets,
        summary.targets_failed,
        summary.blocks_scanned,
        summary.rows_inserted,
        summary.duplicates_skipped,
        summary.discovered_pools.len(),
        summary.elapsed_secs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_line_contents() {
        let summary = RunSummary {
            targets: 12,
            targets_failed: 1,
            blocks_scanned: 48_213,
            rows_inserted: 1_034,
            duplicates_skipped: 12,
            elapsed_secs: 38.2,
            discovered_pools: Vec::new(),
        };
        let line = scan_line("scan", &summary);
        assert!(line.contains("scan"));
        assert!(line.contains("targets=12"));
        assert!(line.contains("failed=1"));
        assert!(line.contains("blocks=48213"));
        assert!(line.contains("inserted=1034"));
        assert!(line.contains("duplicates=12"));
        assert!(line.contains("elapsed=38.2s"));
    }

    #[test]
    fn test_append_is_append_only() {
        let path = std::env::temp_dir().join(format!(
            "poolflow-runlog-test-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let log = RunLog::new(&path);
        log.append("first").unwrap();
        log.append("second").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
        let _ = std::fs::remove_file(&path);
    }
}
