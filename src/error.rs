use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Villip proxy
#[derive(Error, Debug)]
pub enum VillipError {
    // Rule construction errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("\"{0}\" in restricted parameter is not a valid CIDR")]
    InvalidCidr(String),

    #[error("Failed to compile '{pattern}' regular expression: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{0} is not a valid HTTP status")]
    InvalidStatus(String),

    #[error("{0} is not a valid priority")]
    InvalidPriority(String),

    #[error("{0} is not a valid TCP port")]
    InvalidPort(String),

    #[error("'{0}' is not a valid action for token condition")]
    InvalidTokenAction(String),

    #[error("Cannot set a response replace and a replace at the same time")]
    ConflictingReplace,

    #[error("Port {port}: {reason}")]
    PortConflict { port: u16, reason: String },

    // Per-request errors
    #[error("Impossible to decompress: {0}")]
    Decode(String),

    #[error("Impossible to compress: {0}")]
    Encode(String),

    #[error("Failed to read body: {0}")]
    BodyRead(String),

    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Unable to parse source IP")]
    SourceIp,

    // Side-effect errors
    #[error("Dump failed for {request_id}: {reason}")]
    Dump { request_id: String, reason: String },

    // Decoding of configuration files
    #[error("Cannot decode YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Cannot decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Villip operations
pub type Result<T> = std::result::Result<T, VillipError>;

impl VillipError {
    /// Get the HTTP status code returned to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 502 Bad Gateway
            VillipError::Decode(_)
            | VillipError::Encode(_)
            | VillipError::Backend(_)
            | VillipError::Http(_) => StatusCode::BAD_GATEWAY,

            // 400 Bad Request
            VillipError::BodyRead(_) => StatusCode::BAD_REQUEST,

            // 500 Internal Server Error
            VillipError::SourceIp
            | VillipError::Dump { .. }
            | VillipError::Io(_)
            | VillipError::Internal(_)
            | VillipError::InvalidConfig(_)
            | VillipError::InvalidCidr(_)
            | VillipError::InvalidPattern { .. }
            | VillipError::InvalidStatus(_)
            | VillipError::InvalidPriority(_)
            | VillipError::InvalidPort(_)
            | VillipError::InvalidTokenAction(_)
            | VillipError::ConflictingReplace
            | VillipError::PortConflict { .. }
            | VillipError::Yaml(_)
            | VillipError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors that must stop the whole process rather than a single exchange
    pub fn is_fatal(&self) -> bool {
        matches!(self, VillipError::Dump { .. })
    }

    /// Check if this error comes from rule construction
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VillipError::InvalidConfig(_)
                | VillipError::InvalidCidr(_)
                | VillipError::InvalidPattern { .. }
                | VillipError::InvalidStatus(_)
                | VillipError::InvalidPriority(_)
                | VillipError::InvalidPort(_)
                | VillipError::InvalidTokenAction(_)
                | VillipError::ConflictingReplace
                | VillipError::PortConflict { .. }
                | VillipError::Yaml(_)
                | VillipError::Json(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for VillipError {
    fn from(err: hyper::Error) -> Self {
        VillipError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for VillipError {
    fn from(err: url::ParseError) -> Self {
        VillipError::InvalidConfig(format!("invalid url: {}", err))
    }
}
