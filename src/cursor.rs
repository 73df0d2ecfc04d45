use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::CursorError;
use crate::record::Cursor;

const EXTENSION: &str = "cursor";

/// One decimal number in a text file. Single writer.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<state_dir>/<name>.cursor`, with the name reduced to filename-safe chars.
    pub fn in_dir(state_dir: &Path, name: &str) -> Self {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self::new(state_dir.join(format!("{}.{}", safe, EXTENSION)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> CursorError {
        CursorError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Zero when nothing was saved yet. Unreadable content also counts as zero,
    /// which re-processes from the beginning.
    pub fn load(&self) -> Result<Cursor, CursorError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Cursor::parse(&s).unwrap_or_else(|| {
                warn!("cursor file {} is not a number, starting from 0", self.path.display());
                Cursor::ZERO
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Cursor::ZERO),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Write to a sibling temp file, fsync, rename over the target, fsync the
    /// directory so the rename itself survives a crash.
    pub fn save(&self, cursor: Cursor) -> Result<(), CursorError> {
        let dir = match self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(d) => d,
            None => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        let tmp = self.path.with_extension(format!("{}.tmp", EXTENSION));
        {
            let mut f = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
            writeln!(f, "{}", cursor).map_err(|e| self.io_err(e))?;
            f.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        sync_dir(dir).map_err(|e| self.io_err(e))
    }

    pub fn reset(&self) -> Result<bool, CursorError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

// Directory handles cannot be opened for syncing here
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Every `(name, cursor)` saved under `state_dir`, sorted by name.
pub fn list(state_dir: &Path) -> Result<Vec<(String, Cursor)>, CursorError> {
    let entries = match fs::read_dir(state_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CursorError::Io {
                path: state_dir.to_path_buf(),
                source,
            })
        }
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        out.push((name, FileCursorStore::new(path).load()?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
