//! Checks applied to a login response before anyone is logged in.
//!
//! Checks accumulate instead of stopping at the first failure so the logs
//! and debug data show everything that was wrong with a response.
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::IdentityProviderConfig,
    error::Error,
    message::{Assertion, Response},
    store::RequestStore,
};

const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationError {
    StatusFailure {
        code: String,
        message: Option<String>,
    },
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },
    NoAssertion,
    ConditionsFailed(String),
    Unsigned,
    Replayed(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::StatusFailure { code, message } => match message {
                Some(message) => write!(f, "status {} ({})", code, message),
                None => write!(f, "status {}", code),
            },
            ValidationError::CorrelationMismatch { expected, actual } => write!(
                f,
                "InResponseTo {:?} does not match {}",
                actual, expected
            ),
            ValidationError::NoAssertion => write!(f, "response carries no assertion"),
            ValidationError::ConditionsFailed(reason) => write!(f, "{}", reason),
            ValidationError::Unsigned => write!(f, "response is not signed"),
            ValidationError::Replayed(id) => write!(f, "assertion {} was already used", id),
        }
    }
}

/// Everything wrong with a response. Empty means valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{}", errors.join("; "))
    }
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Turn the result into the error that blocks the login, named after the
    /// first failure.
    pub fn into_result(self) -> Result<(), Error> {
        let first = match self.errors.first() {
            None => return Ok(()),
            Some(first) => first.clone(),
        };
        match first {
            ValidationError::StatusFailure { code, message } => {
                Err(Error::StatusFailure { code, message })
            }
            ValidationError::CorrelationMismatch { expected, actual } => {
                Err(Error::CorrelationMismatch { expected, actual })
            }
            _ => Err(Error::Validation(self)),
        }
    }
}

/// What the response is checked against.
#[derive(Clone, Debug)]
pub struct Expectations<'a> {
    pub sp_entity_id: &'a str,
    /// Where responses are posted, matched against `Destination` and the
    /// bearer `Recipient`.
    pub acs_url: &'a str,
    /// ID of the AuthnRequest this response answers. `None` for IdP
    /// initiated logins.
    pub expected_request_id: Option<&'a str>,
    pub now: DateTime<Utc>,
    pub clock_skew: Duration,
}

fn check_assertion(
    assertion: &Assertion,
    idp: &IdentityProviderConfig,
    expectations: &Expectations,
    result: &mut ValidationResult,
) {
    let now = expectations.now;
    let skew = expectations.clock_skew;

    if let Some(issuer) = &assertion.issuer {
        if issuer != &idp.entity_id {
            result.push(ValidationError::ConditionsFailed(format!(
                "assertion issued by {}",
                issuer
            )));
        }
    }

    if let Some(conditions) = &assertion.conditions {
        if let Some(not_before) = conditions.not_before {
            if now + skew < not_before {
                result.push(ValidationError::ConditionsFailed(format!(
                    "assertion not valid before {}",
                    not_before
                )));
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now - skew >= not_on_or_after {
                result.push(ValidationError::ConditionsFailed(format!(
                    "assertion expired at {}",
                    not_on_or_after
                )));
            }
        }
        if !idp.ignore_audience_condition {
            let audience_ok = conditions.audience_restrictions.iter().all(|audiences| {
                audiences
                    .iter()
                    .any(|audience| audience == expectations.sp_entity_id)
            });
            if !audience_ok {
                result.push(ValidationError::ConditionsFailed(format!(
                    "audience does not include {}",
                    expectations.sp_entity_id
                )));
            }
        }
    }

    for confirmation in &assertion.subject_confirmations {
        if confirmation.method.as_deref() != Some(BEARER) {
            continue;
        }
        if let Some(not_on_or_after) = confirmation.not_on_or_after {
            if now - skew >= not_on_or_after {
                result.push(ValidationError::ConditionsFailed(format!(
                    "subject confirmation expired at {}",
                    not_on_or_after
                )));
            }
        }
        if let Some(recipient) = &confirmation.recipient {
            if recipient != expectations.acs_url {
                result.push(ValidationError::ConditionsFailed(format!(
                    "subject confirmation is for {}",
                    recipient
                )));
            }
        }
        if let (Some(expected), Some(actual)) = (
            expectations.expected_request_id,
            confirmation.in_response_to.as_deref(),
        ) {
            if expected != actual {
                result.push(ValidationError::CorrelationMismatch {
                    expected: expected.into(),
                    actual: Some(actual.into()),
                });
            }
        }
    }
}

/// Validate a login response from `idp`.
#[tracing::instrument(level = "info", skip(response, idp, expectations), fields(idp = %idp.id))]
pub fn validate(
    response: &Response,
    idp: &IdentityProviderConfig,
    expectations: &Expectations,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !response.status.is_success() {
        result.push(ValidationError::StatusFailure {
            code: response.status.code.clone(),
            message: response.status.message.clone(),
        });
    }

    if let Some(destination) = &response.destination {
        if destination != expectations.acs_url {
            result.push(ValidationError::ConditionsFailed(format!(
                "response sent to {}",
                destination
            )));
        }
    }

    if let Some(expected) = expectations.expected_request_id {
        if response.in_response_to.as_deref() != Some(expected) {
            result.push(ValidationError::CorrelationMismatch {
                expected: expected.into(),
                actual: response.in_response_to.clone(),
            });
        }
    }

    if response.assertions.is_empty() {
        // A failed status explains the missing assertion already.
        if response.status.is_success() {
            result.push(ValidationError::NoAssertion);
        }
    }
    for assertion in &response.assertions {
        check_assertion(assertion, idp, expectations, &mut result);
    }

    if idp.has_certificates()
        && !response.signed
        && (response.assertions.is_empty() || response.assertions.iter().any(|a| !a.signed))
    {
        result.push(ValidationError::Unsigned);
    }

    if !result.is_valid() {
        tracing::info!("Response {} failed validation: {}", response.id, result);
    }
    result
}

/// Record the response's assertion IDs, flagging any seen before.
pub async fn check_replay<R>(
    store: &R,
    response: &Response,
    now: DateTime<Utc>,
    result: &mut ValidationResult,
) -> Result<(), Error>
where
    R: RequestStore + Sync,
{
    for assertion in &response.assertions {
        let expires_at = assertion
            .conditions
            .as_ref()
            .and_then(|c| c.not_on_or_after)
            .or_else(|| {
                assertion
                    .subject_confirmations
                    .iter()
                    .find_map(|c| c.not_on_or_after)
            })
            .unwrap_or_else(|| now + Duration::hours(1));
        if !store.record_assertion_id(&assertion.id, expires_at).await? {
            tracing::warn!("Assertion {} replayed", assertion.id);
            result.push(ValidationError::Replayed(assertion.id.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        message::{Message, STATUS_RESPONDER},
        store::MemoryStore,
        testing,
    };
    use pretty_assertions::assert_eq;

    fn response(fixture: &testing::ResponseFixture) -> Response {
        match Message::from_xml(&fixture.render()).unwrap() {
            Message::Response(mut response) => {
                response.signed = true;
                response
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn idp() -> IdentityProviderConfig {
        testing::config().tenants[0].identity_providers[0].clone()
    }

    fn expectations(expected_request_id: Option<&str>) -> Expectations<'_> {
        Expectations {
            sp_entity_id: testing::SP_ENTITY_ID,
            acs_url: testing::ACS_URL,
            expected_request_id,
            now: Utc::now(),
            clock_skew: Duration::seconds(180),
        }
    }

    #[test]
    fn test_valid_response() {
        let fixture = testing::ResponseFixture::new();
        let result = validate(
            &response(&fixture),
            &idp(),
            &expectations(fixture.in_response_to.as_deref()),
        );
        assert_eq!(result, ValidationResult::default());
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_expired_response_never_validates() {
        for minutes_ago in &[4, 30, 60 * 24, 60 * 24 * 365] {
            let mut fixture = testing::ResponseFixture::new();
            fixture.not_on_or_after = Utc::now() - Duration::minutes(*minutes_ago);
            let result = validate(
                &response(&fixture),
                &idp(),
                &expectations(fixture.in_response_to.as_deref()),
            );
            assert!(!result.is_valid());
            assert!(result
                .errors
                .iter()
                .any(|e| matches!(e, ValidationError::ConditionsFailed(_))));
        }
    }

    #[test]
    fn test_response_for_other_endpoint() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.destination = "https://elsewhere.example.com/acs".into();
        let result = validate(
            &response(&fixture),
            &idp(),
            &expectations(fixture.in_response_to.as_deref()),
        );
        // Destination and the bearer Recipient both name the other endpoint.
        assert_eq!(
            result.errors,
            vec![
                ValidationError::ConditionsFailed(
                    "response sent to https://elsewhere.example.com/acs".into()
                ),
                ValidationError::ConditionsFailed(
                    "subject confirmation is for https://elsewhere.example.com/acs".into()
                ),
            ]
        );
        assert!(matches!(result.into_result(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_clock_skew_is_tolerated() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.not_before = Utc::now() + Duration::seconds(60);
        fixture.not_on_or_after = Utc::now() - Duration::seconds(60);
        let result = validate(
            &response(&fixture),
            &idp(),
            &expectations(fixture.in_response_to.as_deref()),
        );
        assert!(result.is_valid(), "{}", result);
    }

    #[test]
    fn test_correlation_mismatch() {
        let fixture = testing::ResponseFixture::new();
        let result = validate(&response(&fixture), &idp(), &expectations(Some("_other")));
        assert!(matches!(
            result.clone().into_result(),
            Err(Error::CorrelationMismatch { .. })
        ));
    }

    #[test]
    fn test_idp_initiated_is_not_a_mismatch() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.in_response_to = None;
        assert!(validate(&response(&fixture), &idp(), &expectations(None)).is_valid());

        // A stale InResponseTo without a recorded request is still accepted.
        let fixture = testing::ResponseFixture::new();
        assert!(validate(&response(&fixture), &idp(), &expectations(None)).is_valid());
    }

    #[test]
    fn test_status_failure_is_primary() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.status_code = STATUS_RESPONDER.into();
        fixture.include_assertion = false;
        let result = validate(
            &response(&fixture),
            &idp(),
            &expectations(fixture.in_response_to.as_deref()),
        );
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            result.into_result(),
            Err(Error::StatusFailure { code, .. }) if code == STATUS_RESPONDER
        ));
    }

    #[test]
    fn test_audience() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.audience = "https://someone-else.example.com".into();
        let mut idp = idp();
        let result = validate(
            &response(&fixture),
            &idp,
            &expectations(fixture.in_response_to.as_deref()),
        );
        assert!(matches!(
            result.errors.as_slice(),
            [ValidationError::ConditionsFailed(_)]
        ));

        idp.ignore_audience_condition = true;
        assert!(validate(
            &response(&fixture),
            &idp,
            &expectations(fixture.in_response_to.as_deref())
        )
        .is_valid());
    }

    #[test]
    fn test_unsigned_response_with_certificates_on_file() {
        let fixture = testing::ResponseFixture::new();
        let mut unsigned = response(&fixture);
        unsigned.signed = false;
        let result = validate(
            &unsigned,
            &idp(),
            &expectations(fixture.in_response_to.as_deref()),
        );
        assert_eq!(result.errors, vec![ValidationError::Unsigned]);

        // Signed assertions are enough.
        unsigned.assertions.iter_mut().for_each(|a| a.signed = true);
        assert!(validate(
            &unsigned,
            &idp(),
            &expectations(fixture.in_response_to.as_deref())
        )
        .is_valid());

        let mut no_certificates = idp();
        no_certificates.certificates.clear();
        unsigned.assertions.iter_mut().for_each(|a| a.signed = false);
        assert!(validate(
            &unsigned,
            &no_certificates,
            &expectations(fixture.in_response_to.as_deref())
        )
        .is_valid());
    }

    #[test]
    fn test_errors_accumulate() {
        let mut fixture = testing::ResponseFixture::new();
        fixture.not_on_or_after = Utc::now() - Duration::hours(1);
        fixture.audience = "https://someone-else.example.com".into();
        let result = validate(&response(&fixture), &idp(), &expectations(Some("_other")));
        assert!(result.errors.len() >= 3, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn test_replay_detection() {
        let store = MemoryStore::new().unwrap();
        let fixture = testing::ResponseFixture::new();
        let response = response(&fixture);

        let mut first = ValidationResult::default();
        check_replay(&store, &response, Utc::now(), &mut first)
            .await
            .unwrap();
        assert!(first.is_valid());

        let mut second = ValidationResult::default();
        check_replay(&store, &response, Utc::now(), &mut second)
            .await
            .unwrap();
        assert_eq!(
            second.errors,
            vec![ValidationError::Replayed(fixture.assertion_id.clone())]
        );
    }
}
