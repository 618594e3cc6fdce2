use thiserror::Error;
use warp::http::StatusCode;

use crate::validator::ValidationResult;

/// Errors used within the app.
///
/// The first group mirrors the ways a SAML exchange can fail, the rest are the
/// plumbing failures around it. Each kind maps to exactly one HTTP treatment
/// through [Error::status_code].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed SAML message: {0}")]
    MalformedMessage(String),
    #[error("Unknown SAML message type: {0}")]
    UnknownMessageType(String),
    #[error("Unsigned {0} from an identity provider that requires signatures")]
    UnsignedMessage(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Failed to decrypt: {0}")]
    DecryptionFailed(String),
    #[error("Conditions not met: {0}")]
    ConditionsFailed(String),
    #[error("Identity provider returned status {code}")]
    StatusFailure {
        code: String,
        message: Option<String>,
    },
    #[error("InResponseTo {actual:?} does not match outstanding request {expected}")]
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("Assertion is missing the login attribute {0}")]
    MissingAttribute(String),
    #[error("No identity found for {0}")]
    UnknownUser(String),
    #[error("Identity {0} is suspended")]
    SuspendedUser(String),
    #[error("No identity provider matches {0}")]
    NoMatchingProvider(String),
    #[error("NameID does not match current session")]
    NameIdMismatch,
    #[error("Login response failed validation: {0}")]
    Validation(ValidationResult),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to render template: {0}")]
    TemplateError(#[from] askama::Error),
    #[error("Store failed: {0}")]
    StoreError(#[from] crate::store::Error),
    #[error("OpenSSL failure: {0}")]
    OpenSslError(#[from] openssl::error::ErrorStack),
}

/// Message shown to users for any failed federated login. It deliberately
/// says nothing about which step failed.
pub const GENERIC_LOGIN_FAILURE: &str =
    "There was a problem logging in at your identity provider. Please try again.";

impl Error {
    /// HTTP status the request should finish with.
    ///
    /// [StatusCode::FOUND] means "redirect to the login page with a flash",
    /// the handler picks the destination.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedMessage(_)
            | Error::UnknownMessageType(_)
            | Error::UnsignedMessage(_)
            | Error::InvalidSignature(_)
            | Error::DecryptionFailed(_) => StatusCode::BAD_REQUEST,
            Error::NoMatchingProvider(_) | Error::InvalidConfig(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::ConditionsFailed(_)
            | Error::StatusFailure { .. }
            | Error::CorrelationMismatch { .. }
            | Error::MissingAttribute(_)
            | Error::UnknownUser(_)
            | Error::SuspendedUser(_)
            | Error::NameIdMismatch
            | Error::Validation(_) => StatusCode::FOUND,
            Error::TemplateError(_) | Error::StoreError(_) | Error::OpenSslError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Text safe to show to the person logging in.
    pub fn user_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::FOUND => GENERIC_LOGIN_FAILURE,
            StatusCode::BAD_REQUEST => "The login request could not be processed.",
            StatusCode::UNPROCESSABLE_ENTITY => {
                "Single sign-on is not configured correctly for this account."
            }
            _ => "Something went wrong. Please try again later.",
        }
    }
}
