//! Runtime directory and persisted tunnel record
//!
//! The runtime directory is created at startup. It holds `tunnel.json`, the
//! handle of the tunnel this process (or a previous, crashed instance)
//! started, so teardown never has to guess which process owns the tunnel.

use crate::tunnel::transport::TunnelHandle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

const RECORD_FILE: &str = "tunnel.json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Runtime directory error at {path}: {source}")]
    DirError { path: PathBuf, source: io::Error },
    #[error("Failed to access tunnel record: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to parse tunnel record: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// What is persisted about a live tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub handle: TunnelHandle,
    pub local_interface: String,
    pub remote_host: IpAddr,
}

#[derive(Debug, Clone)]
pub struct RuntimeDir {
    path: PathBuf,
}

impl RuntimeDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the directory if it does not exist yet
    pub fn ensure(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.path).map_err(|source| StateError::DirError {
            path: self.path.clone(),
            source,
        })
    }

    fn record_path(&self) -> PathBuf {
        self.path.join(RECORD_FILE)
    }

    pub fn save_record(&self, record: &TunnelRecord) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(record)?;
        fs::write(self.record_path(), content)?;
        Ok(())
    }

    pub fn load_record(&self) -> Result<Option<TunnelRecord>, StateError> {
        match fs::read_to_string(self.record_path()) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_record(&self) -> Result<(), StateError> {
        match fs::remove_file(self.record_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> TunnelRecord {
        TunnelRecord {
            handle: TunnelHandle { pid: 31337 },
            local_interface: "tun0".to_string(),
            remote_host: "203.0.113.10".parse().unwrap(),
        }
    }

    #[test]
    fn test_ensure_creates_nested_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run").join("tunguard");
        let dir = RuntimeDir::new(&path);
        assert!(!path.exists());

        dir.ensure().unwrap();
        assert!(path.is_dir());

        // Second call is a no-op
        dir.ensure().unwrap();
    }

    #[test]
    fn test_record_save_load_clear() {
        let temp_dir = TempDir::new().unwrap();
        let dir = RuntimeDir::new(temp_dir.path());

        assert_eq!(dir.load_record().unwrap(), None);

        dir.save_record(&record()).unwrap();
        assert_eq!(dir.load_record().unwrap(), Some(record()));

        dir.clear_record().unwrap();
        assert_eq!(dir.load_record().unwrap(), None);
    }

    #[test]
    fn test_clear_missing_record_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let dir = RuntimeDir::new(temp_dir.path());
        assert!(dir.clear_record().is_ok());
    }

    #[test]
    fn test_corrupt_record_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let dir = RuntimeDir::new(temp_dir.path());
        fs::write(temp_dir.path().join(RECORD_FILE), "{not json").unwrap();

        assert!(matches!(dir.load_record(), Err(StateError::ParseError(_))));
    }

    #[test]
    fn test_ensure_fails_under_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let dir = RuntimeDir::new(blocker.join("sub"));
        assert!(matches!(dir.ensure(), Err(StateError::DirError { .. })));
    }
}
