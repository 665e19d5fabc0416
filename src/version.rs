use semver::Version;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::LauncherError;

/// A parsed `major.minor.patch[-pre]` identifier, ordered by semver precedence.
/// Build metadata is kept for display but never takes part in comparisons.
#[derive(Debug, Clone)]
pub struct SemanticVersion(Version);

impl PartialEq for SemanticVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemanticVersion {}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_precedence(&other.0)
    }
}

impl Hash for SemanticVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.major.hash(state);
        self.0.minor.hash(state);
        self.0.patch.hash(state);
        self.0.pre.hash(state);
    }
}

impl SemanticVersion {
    pub fn parse(input: &str) -> Result<Self, LauncherError> {
        Version::parse(input)
            .map(SemanticVersion)
            .map_err(|err| LauncherError::InvalidVersion {
                input: input.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn is_pre_release(&self) -> bool {
        !self.0.pre.is_empty()
    }

    pub fn pre_release(&self) -> Option<&str> {
        if self.0.pre.is_empty() {
            None
        } else {
            Some(self.0.pre.as_str())
        }
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SemanticVersion {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SemanticVersion::parse(s)
    }
}

impl Serialize for SemanticVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub fn latest<'a, I>(versions: I) -> Option<SemanticVersion>
where
    I: IntoIterator<Item = &'a SemanticVersion>,
{
    versions.into_iter().max().cloned()
}

pub fn latest_stable<'a, I>(versions: I) -> Option<SemanticVersion>
where
    I: IntoIterator<Item = &'a SemanticVersion>,
{
    versions
        .into_iter()
        .filter(|version| !version.is_pre_release())
        .max()
        .cloned()
}

/// Ascending, without duplicates.
pub fn sorted<'a, I>(versions: I) -> Vec<SemanticVersion>
where
    I: IntoIterator<Item = &'a SemanticVersion>,
{
    let mut out: Vec<SemanticVersion> = versions.into_iter().cloned().collect();
    out.sort();
    out.dedup();
    out
}
