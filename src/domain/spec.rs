//! Structured application specification produced by the planning stage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application specification returned by the spec generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    /// snake_case application name
    #[serde(default)]
    pub app_name: String,

    /// Human readable name
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub models: Vec<ModelDef>,

    #[serde(default)]
    pub endpoints: Vec<EndpointDef>,

    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub has_auth: bool,

    #[serde(default)]
    pub auth_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub table_name: String,

    #[serde(default)]
    pub fields: Vec<FieldDef>,

    #[serde(default)]
    pub relationships: Vec<RelationshipDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDef {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub foreign_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDef {
    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub operation: Option<String>,

    #[serde(default)]
    pub auth_required: bool,
}

/// Bounds a generated specification must respect
#[derive(Debug, Clone, Copy)]
pub struct SpecLimits {
    pub max_models: usize,
    pub max_endpoints: usize,
}

impl Default for SpecLimits {
    fn default() -> Self {
        Self {
            max_models: 6,
            max_endpoints: 20,
        }
    }
}

/// Reasons a generated specification is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecViolation {
    #[error("Specification is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Specification must define at least one model")]
    NoModels,

    #[error("Too many models ({actual}). Maximum is {limit}")]
    TooManyModels { actual: usize, limit: usize },

    #[error("Specification must define at least one endpoint")]
    NoEndpoints,

    #[error("Too many endpoints ({actual}). Maximum is {limit}")]
    TooManyEndpoints { actual: usize, limit: usize },

    #[error("Model #{0} has no name")]
    UnnamedModel(usize),

    #[error("Endpoint #{0} is missing a method or path")]
    IncompleteEndpoint(usize),
}

impl AppSpec {
    /// Check the specification against structural bounds
    pub fn validate(&self, limits: &SpecLimits) -> Result<(), SpecViolation> {
        if self.app_name.trim().is_empty() {
            return Err(SpecViolation::MissingField("app_name"));
        }
        if self.display_name.trim().is_empty() {
            return Err(SpecViolation::MissingField("display_name"));
        }

        if self.models.is_empty() {
            return Err(SpecViolation::NoModels);
        }
        if self.models.len() > limits.max_models {
            return Err(SpecViolation::TooManyModels {
                actual: self.models.len(),
                limit: limits.max_models,
            });
        }

        if self.endpoints.is_empty() {
            return Err(SpecViolation::NoEndpoints);
        }
        if self.endpoints.len() > limits.max_endpoints {
            return Err(SpecViolation::TooManyEndpoints {
                actual: self.endpoints.len(),
                limit: limits.max_endpoints,
            });
        }

        if let Some(idx) = self.models.iter().position(|m| m.name.trim().is_empty()) {
            return Err(SpecViolation::UnnamedModel(idx));
        }

        if let Some(idx) = self
            .endpoints
            .iter()
            .position(|e| e.method.trim().is_empty() || e.path.trim().is_empty())
        {
            return Err(SpecViolation::IncompleteEndpoint(idx));
        }

        Ok(())
    }

    /// One-line summary used in event messages
    pub fn summary(&self) -> String {
        format!(
            "{} ({} models, {} endpoints)",
            self.display_name,
            self.models.len(),
            self.endpoints.len()
        )
    }
}
