use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Reasons a bearer token or password operation is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Token expired")]
    Expired,

    #[error("Token issued for a different purpose")]
    WrongIssuer,

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Unsupported signing algorithm")]
    UnsupportedAlgorithm,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}
