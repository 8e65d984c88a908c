use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,

    #[error("invalid syslog priority")]
    InvalidPriority,

    #[error("invalid syslog version")]
    InvalidVersion,

    #[error("syslog header truncated at {0}")]
    Truncated(&'static str),

    #[error("unterminated structured data element")]
    InvalidStructuredData,

    #[error("syslog record has no message")]
    MissingMessage,

    #[error("syslog message is not valid UTF-8")]
    MessageNotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

impl ParseError {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ParseError::MissingField(field) | ParseError::InvalidField { field, .. } => Some(*field),
            ParseError::Json(_) | ParseError::NotAnObject => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timestamp {raw:?}: {reason}")]
pub struct TimestampError {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode points: {0}")]
    Encode(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("input error: {0}")]
    Input(#[source] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Decode(_) => "decode",
            PipelineError::Parse(_) => "parse",
            PipelineError::Timestamp(_) => "timestamp",
            PipelineError::Backend(_) => "backend",
            PipelineError::Input(_) => "input",
        }
    }
}
