use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// One line of `<dir>/<start %Y%m%d_%H%M>.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    pub mode: &'static str,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub items: usize,
    pub ok: bool,
    pub err: Option<String>,
}

pub fn append(dir: &Path, entry: &RunLogEntry) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.jsonl", entry.start.format("%Y%m%d_%H%M")));
    let line = serde_json::to_string(entry)?;
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(f, "{}", line).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
