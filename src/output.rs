//! Result output
//!
//! Append-only sink for matched execution units. The engine guarantees at
//! most one write per successful match and zero writes for skipped units;
//! the sink guarantees whole records: all workers serialize through one
//! writer, so records never interleave partially.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// One matched execution unit
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Template the match reports under (a cluster member, not the
    /// cluster representative)
    pub template: String,
    pub target: String,
    pub matched_at: DateTime<Utc>,
    /// Extracted response data, if any
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extracted: Vec<String>,
    /// Set when the match came from an out-of-band interaction rather than
    /// the probe's synchronous response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_protocol: Option<String>,
}

impl ScanResult {
    pub fn new(template: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            target: target.into(),
            matched_at: Utc::now(),
            extracted: Vec::new(),
            interaction_protocol: None,
        }
    }
}

/// Append-only writer accepting one record per matched unit
pub trait ResultSink: Send + Sync {
    fn write(&self, result: &ScanResult) -> Result<()>;

    /// Flush and release the sink. Errors here are reported but must not
    /// mask the run's primary result.
    fn close(&self);
}

enum Destination {
    Stdout,
    File(BufWriter<File>),
}

/// JSONL writer to stdout or a file, one record per line
pub struct StandardWriter {
    dest: Mutex<Destination>,
}

impl StandardWriter {
    pub fn stdout() -> Self {
        Self {
            dest: Mutex::new(Destination::Stdout),
        }
    }

    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            dest: Mutex::new(Destination::File(BufWriter::new(file))),
        })
    }
}

impl ResultSink for StandardWriter {
    fn write(&self, result: &ScanResult) -> Result<()> {
        let line = serde_json::to_string(result)?;
        let mut dest = self.dest.lock();
        match &mut *dest {
            Destination::Stdout => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                writeln!(handle, "{}", line)?;
            }
            Destination::File(writer) => {
                writeln!(writer, "{}", line)?;
            }
        }
        Ok(())
    }

    fn close(&self) {
        if let Destination::File(writer) = &mut *self.dest.lock() {
            if let Err(e) = writer.flush() {
                warn!("failed to flush result file: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_writer_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        let writer = StandardWriter::file(&path).unwrap();
        writer
            .write(&ScanResult::new("cve-2024-0001", "https://a.example.com"))
            .unwrap();
        let mut second = ScanResult::new("cve-2024-0002", "https://b.example.com");
        second.extracted.push("admin-token".into());
        writer.write(&second).unwrap();
        writer.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("cve-2024-0001"));
        assert!(lines[1].contains("admin-token"));
        // Each line is a standalone JSON record
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
