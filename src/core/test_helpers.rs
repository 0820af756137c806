//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::nft_json::NftConn;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("NFTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("NFTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Path of `tests/mock_nft.sh`
pub fn mock_nft_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("mock_nft.sh")
}

/// A private state directory for the mock nft script.
///
/// Listings are served from fixture files, committed batches are appended to
/// `batches.log`, and a `fail` file makes every call fail with its content.
pub struct MockNft {
    dir: TempDir,
}

impl MockNft {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// `sh tests/mock_nft.sh <state dir>`
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            mock_nft_script().to_string_lossy().into_owned(),
            self.dir.path().to_string_lossy().into_owned(),
        ]
    }

    pub fn conn(&self) -> NftConn {
        NftConn::with_command(self.command())
    }

    pub fn serve_set(&self, name: &str, listing: &Value) {
        std::fs::write(
            self.dir.path().join(format!("set_{name}.json")),
            listing.to_string(),
        )
        .unwrap();
    }

    pub fn serve_chain(&self, name: &str, listing: &Value) {
        std::fs::write(
            self.dir.path().join(format!("chain_{name}.json")),
            listing.to_string(),
        )
        .unwrap();
    }

    pub fn fail_with(&self, stderr: &str) {
        std::fs::write(self.dir.path().join("fail"), stderr).unwrap();
    }

    /// Every batch received on stdin, in order
    pub fn batches(&self) -> Vec<Value> {
        std::fs::read_to_string(self.dir.path().join("batches.log"))
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    /// Argument lines of every invocation
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
