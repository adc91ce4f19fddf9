use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SdkError;

// Anything that ends up as a single path segment under a scratch root.
static PATH_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]{0,127}$").unwrap());

pub fn is_path_segment(value: &str) -> bool {
    PATH_SEGMENT.is_match(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Initialize,
    Evaluate,
    Generate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Initialize => write!(f, "initialize"),
            Operation::Evaluate => write!(f, "evaluate"),
            Operation::Generate => write!(f, "generate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndividualId(String);

impl IndividualId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndividualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IndividualId {
    type Err = SdkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !is_path_segment(value) {
            return Err(SdkError::InvalidIndividualId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigName(String);

impl ConfigName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConfigName {
    type Err = SdkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !is_path_segment(trimmed) {
            return Err(SdkError::InvalidConfigName(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

pub fn parse_cohort<'a, I>(cohort: &str, ids: I) -> Result<Vec<IndividualId>, SdkError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut parsed = Vec::new();
    for raw in ids {
        let id: IndividualId = raw.parse()?;
        if !seen.insert(id.clone()) {
            return Err(SdkError::DuplicateIndividual {
                cohort: cohort.to_string(),
                id: id.to_string(),
            });
        }
        parsed.push(id);
    }
    Ok(parsed)
}
