use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::is_path_segment;
use crate::error::SdkError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub initialize: InitializeConfig,
    pub evaluate: EvaluateConfig,
    pub generate: GenerateConfig,
    // Unknown top-level sections, kept for the module.
    #[serde(flatten)]
    extensions: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InitializeConfig {
    pub root_individuals: BTreeMap<String, RootIndividualConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RootIndividualConfig {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluateConfig {
    pub phenotype: BTreeMap<String, PhenotypeFileConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhenotypeFileConfig {
    pub name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateConfig {
    pub population_size: usize,
}

impl Config {
    pub fn extensions(&self) -> &BTreeMap<String, Value> {
        &self.extensions
    }

    pub fn extension<T: DeserializeOwned>(&self, section: &str) -> Result<T, SdkError> {
        let value = self.extensions.get(section).ok_or_else(|| {
            SdkError::ConfigInvalid(format!("missing extension section '{section}'"))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|err| SdkError::ConfigInvalid(format!("section '{section}': {err}")))
    }

    pub fn validate(&self) -> Result<(), SdkError> {
        if self.initialize.root_individuals.is_empty() {
            return Err(SdkError::ConfigInvalid(
                "initialize.root_individuals must not be empty".to_string(),
            ));
        }
        for (key, phenotype) in &self.evaluate.phenotype {
            if !is_path_segment(&phenotype.name) {
                return Err(SdkError::ConfigInvalid(format!(
                    "evaluate.phenotype.{key}.name is not a plain file name: {}",
                    phenotype.name
                )));
            }
        }
        if self.generate.population_size == 0 {
            return Err(SdkError::ConfigInvalid(
                "generate.population_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: &Utf8Path) -> Result<Config, SdkError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                SdkError::ConfigNotFound(
                    path.file_name().unwrap_or(path.as_str()).to_string(),
                )
            } else {
                SdkError::ConfigParse(format!("read {path}: {err}"))
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, SdkError> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|err| SdkError::ConfigParse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
