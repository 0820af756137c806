//! Privilege elevation for nft
//!
//! nftsync usually runs as root (as a service) and then calls `nft` directly.
//! When started by an unprivileged user, e.g. for a `oneshot` run from a
//! terminal, every `nft` invocation is wrapped in an elevation helper.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `NFTSYNC_NFT_COMMAND`: command used instead of `nft`, split on
//!   whitespace (e.g. `/usr/local/sbin/nft` or `sh /path/to/mock_nft.sh`).
//! - `NFTSYNC_ELEVATION_METHOD`: force `sudo`, `run0` or `pkexec`. Useful
//!   with sudoers NOPASSWD rules.
//! - `NFTSYNC_NO_ELEVATION`: never elevate.
//!
//! # Example
//!
//! ```no_run
//! use nftsync::elevation::create_elevated_nft_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_nft_command(&["--json", "list", "tables"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::Path;
use tokio::process::Command;

pub const NFT_COMMAND_ENV: &str = "NFTSYNC_NFT_COMMAND";
pub const ELEVATION_METHOD_ENV: &str = "NFTSYNC_ELEVATION_METHOD";
pub const NO_ELEVATION_ENV: &str = "NFTSYNC_NO_ELEVATION";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit or run as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `NFTSYNC_ELEVATION_METHOD`
    #[error("Invalid NFTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    Sudo,
    Run0,
    Pkexec,
}

/// Checks if a binary exists, either at the given path or in PATH
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    })
}

/// The nft command line: `NFTSYNC_NFT_COMMAND` split on whitespace, or `nft`
pub fn nft_program() -> Vec<String> {
    let configured: Vec<String> = std::env::var(NFT_COMMAND_ENV)
        .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    if configured.is_empty() {
        vec!["nft".to_string()]
    } else {
        configured
    }
}

/// Runs `program` as is, without elevation
pub fn direct_command(program: &[String], args: &[&str]) -> Command {
    let (name, prefix) = program
        .split_first()
        .map_or(("nft", &[][..]), |(n, p)| (n.as_str(), p));
    let mut cmd = Command::new(name);
    cmd.args(prefix).args(args);
    cmd
}

fn wrapped(method: ElevationMethod, program: &[String], args: &[&str]) -> Command {
    let mut cmd = Command::new(method.to_string());
    cmd.args(program).args(args);
    cmd
}

/// Builds the command running `program args` with root privileges
pub fn build_elevated_command(program: &[String], args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var_os(NO_ELEVATION_ENV).is_some() || nix::unistd::getuid().is_root() {
        return Ok(direct_command(program, args));
    }

    if let Ok(method) = std::env::var(ELEVATION_METHOD_ENV)
        && !method.is_empty()
    {
        let method: ElevationMethod = method
            .parse()
            .map_err(|_| ElevationError::InvalidMethod(method.to_lowercase()))?;
        if !binary_exists(&method.to_string()) {
            return Err(ElevationError::MethodNotAvailable(method.to_string()));
        }
        return Ok(wrapped(method, program, args));
    }

    if binary_exists("run0") {
        return Ok(wrapped(ElevationMethod::Run0, program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped(ElevationMethod::Sudo, program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped(ElevationMethod::Pkexec, program, args))
    }
}

/// Creates an elevated nft command with the specified arguments.
///
/// Arguments are passed directly without shell interpretation.
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(&nft_program(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    fn program_of(cmd: &Command) -> Vec<String> {
        let std_cmd = cmd.as_std();
        std::iter::once(std_cmd.get_program())
            .chain(std_cmd.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(binary_exists("/bin/sh"));
        assert!(!binary_exists("nftsync_nonexistent_binary_xyz"));
        assert!(!binary_exists("/nonexistent/nft"));
    }

    #[test]
    fn test_nft_program_from_env() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var(NFT_COMMAND_ENV, "sh  /tmp/mock_nft.sh");
        }
        let program = nft_program();
        unsafe {
            std::env::set_var(NFT_COMMAND_ENV, "   ");
        }
        let blank = nft_program();
        unsafe {
            std::env::remove_var(NFT_COMMAND_ENV);
        }

        assert_eq!(program, vec!["sh", "/tmp/mock_nft.sh"]);
        assert_eq!(blank, vec!["nft"]);
        assert_eq!(nft_program(), vec!["nft"]);
    }

    #[test]
    fn test_no_elevation_runs_directly() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var(NO_ELEVATION_ENV, "1");
        }
        let cmd = build_elevated_command(&["sh".to_string(), "mock.sh".to_string()], &["--json", "-f", "-"]);
        unsafe {
            std::env::remove_var(NO_ELEVATION_ENV);
        }

        assert_eq!(
            program_of(&cmd.unwrap()),
            vec!["sh", "mock.sh", "--json", "-f", "-"]
        );
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        if nix::unistd::getuid().is_root() {
            return;
        }

        unsafe {
            std::env::remove_var(NO_ELEVATION_ENV);
            std::env::set_var(ELEVATION_METHOD_ENV, "invalid_method");
        }
        let result = create_elevated_nft_command(&["list", "ruleset"]);
        unsafe {
            std::env::remove_var(ELEVATION_METHOD_ENV);
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        assert_eq!("SUDO".parse::<ElevationMethod>().unwrap(), ElevationMethod::Sudo);
        assert_eq!("run0".parse::<ElevationMethod>().unwrap(), ElevationMethod::Run0);
        assert_eq!(ElevationMethod::Pkexec.to_string(), "pkexec");
        assert!("doas".parse::<ElevationMethod>().is_err());
    }
}
