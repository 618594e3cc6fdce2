pub use askama::Template;

use crate::message::{NameId, Status};

#[derive(Template)]
#[template(path = "authn_request.xml")]
pub struct AuthnRequestTemplate<'a> {
    pub id: &'a str,
    pub issue_instant: String,
    pub destination: &'a str,
    pub issuer: &'a str,
    /// Where the IdP should POST its response.
    pub assertion_consumer_service_url: &'a str,
    pub force_authn: bool,
    /// Rendered as `NameIDPolicy` when set.
    pub name_id_format: Option<&'a str>,
    /// `AuthnContextClassRef` to request, if any.
    pub requested_authn_context: Option<&'a str>,
}

#[derive(Template)]
#[template(path = "logout_request.xml")]
pub struct LogoutRequestTemplate<'a> {
    pub id: &'a str,
    pub issue_instant: String,
    pub destination: &'a str,
    pub issuer: &'a str,
    pub name_id: &'a NameId,
    pub session_indexes: &'a [String],
}

#[derive(Template)]
#[template(path = "logout_response.xml")]
pub struct LogoutResponseTemplate<'a> {
    pub id: &'a str,
    pub in_response_to: Option<&'a str>,
    pub issue_instant: String,
    pub destination: &'a str,
    pub issuer: &'a str,
    pub status: &'a Status,
}

/// Template to render the SP metadata document.
#[derive(Template)]
#[template(path = "metadata.xml")]
pub struct Metadata<'a> {
    /// SP entity ID.
    pub entity_id: &'a str,
    /// Date until which the metadata is valid.
    pub valid_until: String,
    /// Base64 DER of the certificate used to sign requests and receive
    /// encrypted assertions.
    pub certificate: String,
    pub authn_requests_signed: bool,
    pub name_id_formats: Vec<&'a str>,
    /// Assertion consumer service, HTTP-POST.
    pub acs_url: String,
    /// Single logout service, HTTP-Redirect.
    pub slo_url: String,
}
