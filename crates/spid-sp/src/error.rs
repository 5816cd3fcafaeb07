/// Fatal startup problems. Any of these aborts the host before it serves a
/// single login.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("signing key does not match the certificate public key")]
    KeyMismatch,
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("malformed metadata XML: {0}")]
    MalformedXml(String),
    #[error("no signing certificate for {0}")]
    MissingCertificate(String),
    #[error("invalid signing certificate for {entity_id}: {reason}")]
    InvalidCertificate { entity_id: String, reason: String },
    #[error("no SSO or SLO endpoint with a supported binding for {0}")]
    MissingEndpoint(String),
    #[error("no identity provider entity {0} in metadata")]
    EntityNotFound(String),
    #[error("metadata signature invalid: {0}")]
    SignatureInvalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("identity provider has no {0} endpoint with a supported binding")]
    NoEndpoint(&'static str),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("random generator failed: {0}")]
    Entropy(String),
}

/// Every way an inbound SAML message can be rejected. A message that yields
/// any of these is never partially trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("destination mismatch: expected {expected}, got {actual:?}")]
    DestinationMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("unsolicited response: {0}")]
    UnsolicitedResponse(String),
    #[error("replayed response for request {0}")]
    ReplayedResponse(String),
    #[error("expired: {0}")]
    ExpiredAssertion(String),
    #[error("not yet valid: {0}")]
    NotYetValid(String),
    #[error("audience mismatch: expected {expected}, got {actual:?}")]
    AudienceMismatch {
        expected: String,
        actual: Vec<String>,
    },
    #[error("insufficient authentication context: requested {requested}, got {actual}")]
    InsufficientAuthnContext { requested: String, actual: String },
    #[error("issuer mismatch: expected {expected}, got {actual:?}")]
    IssuerMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("identity provider returned status {status}: {message:?}")]
    StatusNotSuccess {
        status: String,
        message: Option<String>,
    },
}

impl ValidationError {
    /// Stable short name for audit logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MalformedResponse(_) => "malformed_response",
            ValidationError::SignatureInvalid(_) => "signature_invalid",
            ValidationError::DestinationMismatch { .. } => "destination_mismatch",
            ValidationError::UnsolicitedResponse(_) => "unsolicited_response",
            ValidationError::ReplayedResponse(_) => "replayed_response",
            ValidationError::ExpiredAssertion(_) => "expired_assertion",
            ValidationError::NotYetValid(_) => "not_yet_valid",
            ValidationError::AudienceMismatch { .. } => "audience_mismatch",
            ValidationError::InsufficientAuthnContext { .. } => "insufficient_authn_context",
            ValidationError::IssuerMismatch { .. } => "issuer_mismatch",
            ValidationError::StatusNotSuccess { .. } => "status_not_success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("assertion validity already ended")]
    AlreadyExpired,
    #[error("random generator failed: {0}")]
    Entropy(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        Error::Configuration(ConfigurationError::Metadata(e))
    }
}
