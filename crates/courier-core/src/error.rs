use thiserror::Error;

/// Errors produced by the courier protocol and service layers.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Numeric codes carried in `Error` envelopes, stable across versions.
pub const CODE_VALIDATION: u32 = 1;
pub const CODE_AUTH: u32 = 2;
pub const CODE_NOT_FOUND: u32 = 3;
pub const CODE_PERSISTENCE: u32 = 4;
pub const CODE_INTERNAL: u32 = 5;

impl CourierError {
    /// The wire code for this error when reported in an `Error` envelope.
    pub fn wire_code(&self) -> u32 {
        match self {
            CourierError::Auth(_) => CODE_AUTH,
            CourierError::NotFound(_) => CODE_NOT_FOUND,
            CourierError::Validation(_) | CourierError::Codec(_) => CODE_VALIDATION,
            CourierError::Persistence(_) => CODE_PERSISTENCE,
            _ => CODE_INTERNAL,
        }
    }

    /// Rebuild an error from an `Error` envelope received over the wire.
    pub fn from_wire(code: u32, message: &str) -> Self {
        match code {
            CODE_AUTH => CourierError::Auth(message.to_string()),
            CODE_NOT_FOUND => CourierError::NotFound(message.to_string()),
            CODE_VALIDATION => CourierError::Validation(message.to_string()),
            CODE_PERSISTENCE => CourierError::Persistence(message.to_string()),
            _ => CourierError::Other(message.to_string()),
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CourierError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CourierError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CourierError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CourierError::Codec(e.to_string())
    }
}

pub type CourierResult<T> = Result<T, CourierError>;
