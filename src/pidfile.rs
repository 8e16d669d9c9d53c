use std::{fs, io, path::{Path, PathBuf}};

use log::debug;
use thiserror::Error;

/// A single process id stored as decimal text in a file.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, pid: i32) -> Result<(), PidFileError> {
        fs::write(&self.path, format!("{pid}\n"))
            .map_err(|e| PidFileError::Write(self.path.clone(), e))
    }

    /// Missing, empty, unreadable or garbage content all read as no pid.
    pub fn read(&self) -> Option<i32> {
        let content = match fs::read_to_string(&self.path) {
            Ok(it) => it,
            Err(e) => {
                debug!("No pid in {} : {e}", self.path.display());
                return None;
            }
        };

        content.trim().parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
    }

    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PidFileError::Remove(self.path.clone(), e))
        }
    }
}

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to write pid file {0} : {1}")]
    Write(PathBuf, #[source] io::Error),
    #[error("Failed to remove pid file {0} : {1}")]
    Remove(PathBuf, #[source] io::Error),
}
