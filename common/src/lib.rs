use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

pub mod config;
pub mod errors;
pub mod http;
pub mod utils;

/// Marker published on a live-output channel and appended to every
/// finished build log.
pub const END_OF_LOG: &str = "ENDOFLOG";

pub const SIG_EXT: &str = ".sig";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
    #[default]
    None,
    Pending,
    Passed,
    Failed,
    Skip,
}

impl ReviewStatus {
    /// Review results a developer may submit.
    pub fn is_result(&self) -> bool {
        matches!(self, ReviewStatus::Passed | ReviewStatus::Failed | ReviewStatus::Skip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BuildState {
    Pending,
    Building,
    Completed,
    Failed,
}

/// A package as seen by a repository, `name|version-release|arch`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PkgRef {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl PkgRef {
    pub fn new<N: Into<String>, V: Into<String>, A: Into<String>>(name: N, version: V, arch: A) -> PkgRef {
        PkgRef {
            name: name.into(),
            version: version.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for PkgRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.name, self.version, self.arch)
    }
}

impl FromStr for PkgRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<PkgRef> {
        let mut parts = s.split('|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(version), Some(arch), None) if !name.is_empty() && !version.is_empty() && !arch.is_empty() => {
                Ok(PkgRef::new(name, version, arch))
            },
            _ => bail!("Invalid package reference: {:?}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkgref_display() {
        let pkg = PkgRef::new("foo", "1.2-1", "x86_64");
        assert_eq!(pkg.to_string(), "foo|1.2-1|x86_64");
    }

    #[test]
    fn test_pkgref_parse() {
        let pkg = "lib32-foo-bar|1:2.0-3|any".parse::<PkgRef>().unwrap();
        assert_eq!(pkg, PkgRef::new("lib32-foo-bar", "1:2.0-3", "any"));
    }

    #[test]
    fn test_pkgref_parse_invalid() {
        assert!("foo|1.0".parse::<PkgRef>().is_err());
        assert!("foo|1.0|x86_64|extra".parse::<PkgRef>().is_err());
        assert!("|1.0|x86_64".parse::<PkgRef>().is_err());
    }

    #[test]
    fn test_review_status_strings() {
        assert_eq!(ReviewStatus::Pending.to_string(), "pending");
        assert_eq!("skip".parse::<ReviewStatus>().unwrap(), ReviewStatus::Skip);
        assert_eq!("none".parse::<ReviewStatus>().unwrap(), ReviewStatus::None);
        assert!("maybe".parse::<ReviewStatus>().is_err());
    }

    #[test]
    fn test_review_results() {
        assert!(ReviewStatus::Passed.is_result());
        assert!(ReviewStatus::Skip.is_result());
        assert!(!ReviewStatus::Pending.is_result());
        assert!(!ReviewStatus::None.is_result());
    }
}
