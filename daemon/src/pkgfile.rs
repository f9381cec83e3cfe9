use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::{PkgRef, SIG_EXT};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// `<name>-[<epoch>:]<pkgver>-<pkgrel>-<arch>.pkg.tar[.<comp>]`
const PATTERN: &str = r"^(?P<name>[a-zA-Z0-9@_+][a-zA-Z0-9@._+-]*)-(?P<pkgver>(?:[0-9]+:)?[^-/:\s]+)-(?P<pkgrel>[0-9]+(?:\.[0-9]+)?)-(?P<arch>[A-Za-z0-9_]+)\.pkg\.tar(?:\.(?P<comp>[a-z0-9]+))?$";

static GRAMMAR: OnceLock<Regex> = OnceLock::new();

fn grammar() -> Result<&'static Regex> {
    if let Some(re) = GRAMMAR.get() {
        return Ok(re);
    }
    let re = Regex::new(PATTERN)?;
    Ok(GRAMMAR.get_or_init(|| re))
}

/// A package archive name split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgFile {
    pub filename: String,
    pub name: String,
    /// Includes the epoch, if any.
    pub pkgver: String,
    pub pkgrel: String,
    pub arch: String,
    pub compression: Option<String>,
}

impl PkgFile {
    pub fn parse(filename: &str) -> Result<PkgFile> {
        let caps = grammar()?
            .captures(filename)
            .ok_or_else(|| format_err!("Unparsable package file name: {:?}", filename))?;

        let get = |name| caps.name(name).map(|m| m.as_str().to_string());
        Ok(PkgFile {
            filename: filename.to_string(),
            name: get("name").unwrap_or_default(),
            pkgver: get("pkgver").unwrap_or_default(),
            pkgrel: get("pkgrel").unwrap_or_default(),
            arch: get("arch").unwrap_or_default(),
            compression: get("comp"),
        })
    }

    /// `[epoch:]pkgver-pkgrel`
    pub fn version(&self) -> String {
        format!("{}-{}", self.pkgver, self.pkgrel)
    }

    pub fn is_any(&self) -> bool {
        self.arch == "any"
    }

    pub fn to_ref(&self) -> PkgRef {
        PkgRef::new(&self.name, self.version(), &self.arch)
    }

    pub fn sig_filename(&self) -> String {
        format!("{}{}", self.filename, SIG_EXT)
    }
}

impl fmt::Display for PkgFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename)
    }
}

/// Whether a directory entry looks like a package archive at all. Such files
/// are expected to match the grammar of [`PkgFile::parse`].
pub fn is_package_file(filename: &str) -> bool {
    filename.contains(".pkg.tar") && !filename.ends_with(SIG_EXT)
}
