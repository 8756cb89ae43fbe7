#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::StorageError;

/// Append-only JSON-lines file. Each value is written and flushed as one line.
#[derive(Debug)]
pub(crate) struct JsonlFile {
    path: PathBuf,
    file: File,
}

impl JsonlFile {
    /// Opens (or creates) `path` for appending and returns every existing line parsed as `T`,
    /// in file order. Any unparsable line fails the open.
    pub(crate) fn open<T: DeserializeOwned>(path: &Path) -> Result<(Self, Vec<T>), StorageError> {
        let path = path.to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(&path, e))?;
            }
        }

        let mut values = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path).map_err(|e| io_err(&path, e))?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line.map_err(|e| io_err(&path, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                let value = serde_json::from_str(&line)
                    .map_err(|e| line_err(&path, idx + 1, e.to_string()))?;
                values.push(value);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        Ok((Self { path, file }, values))
    }

    pub(crate) fn append<T: Serialize>(&mut self, value: &T) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(value).map_err(|e| StorageError::Journal {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|e| io_err(&self.path, e))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn line_err(path: &Path, line: usize, message: String) -> StorageError {
    StorageError::Journal {
        path: path.display().to_string(),
        message: format!("line {line}: {message}"),
    }
}

fn io_err(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Journal {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
