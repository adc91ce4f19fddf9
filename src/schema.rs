use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Config,
    Download,
    Unpack,
    Execute,
    Pack,
    Upload,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FailureStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            stage: None,
            message: None,
        }
    }

    pub fn failed(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            stage: Some(stage),
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub config_name: String,
    pub root_individuals: Vec<RootIndividualRequest>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootIndividualRequest {
    pub id: String,
    pub key: String,
    pub genotype_put_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub config_name: String,
    pub individuals: Vec<EvaluateIndividualRequest>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateIndividualRequest {
    pub id: String,
    pub genotype_get_url: String,
    #[serde(default)]
    pub phenotype_put_urls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub config_name: String,
    pub parent_individuals: Vec<ParentIndividualRequest>,
    pub child_individuals: Vec<ChildIndividualRequest>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentIndividualRequest {
    pub id: String,
    pub genotype_get_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildIndividualRequest {
    pub id: String,
    pub genotype_put_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub root_individuals: Vec<RootIndividualResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootIndividualResult {
    pub id: String,
    pub key: String,
    pub parent_ids: Vec<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub individuals: Vec<IndividualResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualResult {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub child_individuals: Vec<ChildIndividualResult>,
    pub parentage: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildIndividualResult {
    pub id: String,
    pub parent_ids: Vec<String>,
    pub parent_indices: Vec<usize>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub module_name: String,
    pub status: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigQuery {
    pub config_name: String,
}
