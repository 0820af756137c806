//! Line-oriented list files
//!
//! One entry per line; blank lines and lines starting with `#` are ignored.
//! Address lists may mix IPv4 and IPv6 entries, each set only takes the
//! entries of its own family.

use crate::core::error::{Error, Result};
use crate::core::expr::AddrFamily;
use crate::core::objects::SetKeyType;
use crate::core::set_data::{SetData, address_strings_to_set_data, port_strings_to_set_data};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSource {
    path: PathBuf,
}

impl ListSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Meaningful lines of the file, trimmed
    pub fn read_lines(&self) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::validation("list file", format!("{}: {e}", self.path.display()))
        })?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Entries that belong in a set of `key_type`.
    ///
    /// Any malformed line fails the whole read.
    pub fn set_data(&self, key_type: SetKeyType) -> Result<Vec<SetData>> {
        let lines = self.read_lines()?;
        match key_type {
            SetKeyType::InetService => port_strings_to_set_data(&lines),
            SetKeyType::Ipv4Addr | SetKeyType::Ipv6Addr => {
                let wanted = AddrFamily::of_key_type(key_type);
                Ok(address_strings_to_set_data(&lines)?
                    .into_iter()
                    .filter(|d| d.family() == wanted)
                    .collect())
            }
            other => Err(Error::UnsupportedKeyType(other)),
        }
    }
}
