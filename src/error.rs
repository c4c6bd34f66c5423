use std::path::PathBuf;

use thiserror::Error;

/// Errors in the experiment configuration, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("domain `{0}` is not supported")]
    UnknownDomain(String),

    #[error("agent type `{0}` is not supported")]
    UnknownAgentType(String),

    #[error("simulator type `{0}` is not supported")]
    UnknownSimulatorType(String),

    #[error("influence predictor type `{0}` is not supported")]
    UnknownPredictorType(String),

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors in the DBN description or a trained model, fatal at load time
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("variable `{variable}` references unknown parent `{parent}`")]
    UnknownParent { variable: String, parent: String },

    #[error("variable `{variable}` has a malformed CPT row for parents {parents:?}: {reason}")]
    MalformedCpt {
        variable: String,
        parents: Vec<usize>,
        reason: String,
    },

    #[error("variable `{0}` has no values, CPT, or initial distribution to derive a cardinality from")]
    UnknownCardinality(String),

    #[error("variable `{0}` has no initial distribution")]
    MissingInitialDistribution(String),

    #[error("cycle detected while ordering variables; unresolved: {0:?}")]
    Cycle(Vec<String>),

    #[error("model parameter `{name}` has shape {found:?}, expected {expected:?}")]
    BadParameterShape {
        name: String,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
}

/// Top-level error type returned to the experiment driver
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to parse model file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode tensor data: {0}")]
    Encode(#[from] bincode::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
