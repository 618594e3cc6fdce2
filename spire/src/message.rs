//! Typed SAML protocol messages.
//!
//! Inbound documents are parsed into [Message], a closed set of the messages a
//! service provider consumes. Outbound messages ([AuthnRequest],
//! [LogoutRequest], [LogoutResponse]) render themselves through the askama
//! templates in `templates/`.
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, SubsecRound, Utc};
use roxmltree::{Document, Node};

use crate::{
    error::Error,
    templates::{AuthnRequestTemplate, LogoutRequestTemplate, LogoutResponseTemplate, Template},
    xml::{self, ASSERTION_NS, PROTOCOL_NS},
};

pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const STATUS_REQUESTER: &str = "urn:oasis:names:tc:SAML:2.0:status:Requester";
pub const STATUS_RESPONDER: &str = "urn:oasis:names:tc:SAML:2.0:status:Responder";

/// Generate a message ID. IDs must be NCNames, hence the leading underscore.
pub fn generate_id() -> String {
    format!("_{}", uuid::Uuid::new_v4())
}

/// The current instant at the precision SAML messages carry.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

fn or_unspecified(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(NAME_ID_FORMAT_UNSPECIFIED)
}

impl NameId {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.into(),
            format: None,
            name_qualifier: None,
            sp_name_qualifier: None,
        }
    }

    /// Whether two NameIDs identify the same subject for logout purposes.
    ///
    /// All four fields must be equal, an absent format or qualifier counts as
    /// `unspecified` on either side.
    pub fn matches(&self, other: &NameId) -> bool {
        self.value == other.value
            && or_unspecified(&self.format) == or_unspecified(&other.format)
            && or_unspecified(&self.name_qualifier) == or_unspecified(&other.name_qualifier)
            && or_unspecified(&self.sp_name_qualifier)
                == or_unspecified(&other.sp_name_qualifier)
    }

    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            value: xml::text(node).unwrap_or_default(),
            format: node.attribute("Format").map(String::from),
            name_qualifier: node.attribute("NameQualifier").map(String::from),
            sp_name_qualifier: node.attribute("SPNameQualifier").map(String::from),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: STATUS_SUCCESS.into(),
            sub_code: None,
            message: None,
        }
    }

    pub fn responder(message: &str) -> Self {
        Self {
            code: STATUS_RESPONDER.into(),
            sub_code: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    fn from_node(node: Option<Node>) -> Self {
        let node = match node {
            Some(node) => node,
            None => {
                return Self {
                    code: String::new(),
                    sub_code: None,
                    message: None,
                }
            }
        };
        let code = xml::child(node, PROTOCOL_NS, "StatusCode");
        Self {
            code: code
                .and_then(|c| c.attribute("Value"))
                .unwrap_or_default()
                .to_owned(),
            sub_code: code
                .and_then(|c| xml::child(c, PROTOCOL_NS, "StatusCode"))
                .and_then(|c| c.attribute("Value"))
                .map(String::from),
            message: xml::child_text(node, PROTOCOL_NS, "StatusMessage"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One entry per `AudienceRestriction`, each satisfied by any of its
    /// audiences.
    pub audience_restrictions: Vec<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubjectConfirmation {
    pub method: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthnStatement {
    pub session_index: Option<String>,
    pub authn_instant: Option<DateTime<Utc>>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
}

/// Attribute statements flattened into name to values.
pub type Attributes = BTreeMap<String, Vec<String>>;

#[derive(Clone, Debug, PartialEq)]
pub struct Assertion {
    pub id: String,
    pub issuer: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub name_id: Option<NameId>,
    pub subject_confirmations: Vec<SubjectConfirmation>,
    pub conditions: Option<Conditions>,
    pub authn_statements: Vec<AuthnStatement>,
    pub attributes: Attributes,
    /// Covered by a verified signature, its own or the enclosing response's.
    pub signed: bool,
}

impl Assertion {
    pub(crate) fn from_node(node: Node) -> Result<Self, Error> {
        let subject = xml::child(node, ASSERTION_NS, "Subject");
        let subject_confirmations = subject
            .into_iter()
            .flat_map(|s| xml::children(s, ASSERTION_NS, "SubjectConfirmation"))
            .map(|confirmation| {
                let data = xml::child(confirmation, ASSERTION_NS, "SubjectConfirmationData");
                Ok(SubjectConfirmation {
                    method: confirmation.attribute("Method").map(String::from),
                    not_on_or_after: match data {
                        Some(data) => xml::instant_attribute(data, "NotOnOrAfter")?,
                        None => None,
                    },
                    recipient: data
                        .and_then(|d| d.attribute("Recipient"))
                        .map(String::from),
                    in_response_to: data
                        .and_then(|d| d.attribute("InResponseTo"))
                        .map(String::from),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let conditions = match xml::child(node, ASSERTION_NS, "Conditions") {
            Some(conditions) => Some(Conditions {
                not_before: xml::instant_attribute(conditions, "NotBefore")?,
                not_on_or_after: xml::instant_attribute(conditions, "NotOnOrAfter")?,
                audience_restrictions: xml::children(conditions, ASSERTION_NS, "AudienceRestriction")
                    .map(|restriction| {
                        xml::children(restriction, ASSERTION_NS, "Audience")
                            .filter_map(xml::text)
                            .collect()
                    })
                    .collect(),
            }),
            None => None,
        };

        let authn_statements = xml::children(node, ASSERTION_NS, "AuthnStatement")
            .map(|statement| {
                Ok(AuthnStatement {
                    session_index: statement.attribute("SessionIndex").map(String::from),
                    authn_instant: xml::instant_attribute(statement, "AuthnInstant")?,
                    session_not_on_or_after: xml::instant_attribute(
                        statement,
                        "SessionNotOnOrAfter",
                    )?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut attributes = Attributes::new();
        for statement in xml::children(node, ASSERTION_NS, "AttributeStatement") {
            for attribute in xml::children(statement, ASSERTION_NS, "Attribute") {
                let name = match attribute.attribute("Name") {
                    Some(name) => name.to_owned(),
                    None => continue,
                };
                let values = attribute
                    .children()
                    .filter(|c| xml::is(*c, ASSERTION_NS, "AttributeValue"))
                    .filter_map(xml::text);
                attributes.entry(name).or_default().extend(values);
            }
        }

        Ok(Self {
            id: node.attribute("ID").unwrap_or_default().to_owned(),
            issuer: xml::child_text(node, ASSERTION_NS, "Issuer"),
            issue_instant: xml::instant_attribute(node, "IssueInstant")?,
            name_id: subject
                .and_then(|s| xml::child(s, ASSERTION_NS, "NameID"))
                .map(NameId::from_node),
            subject_confirmations,
            conditions,
            authn_statements,
            attributes,
            signed: false,
        })
    }

    /// Parse the first assertion found in a standalone document, as produced
    /// by decrypting an `EncryptedAssertion`.
    pub fn from_document(doc: &Document) -> Result<Self, Error> {
        let node = doc
            .descendants()
            .find(|n| xml::is(*n, ASSERTION_NS, "Assertion"))
            .ok_or_else(|| Error::MalformedMessage("no Assertion in decrypted data".into()))?;
        Self::from_node(node)
    }

    /// Session index of the first authentication statement.
    pub fn session_index(&self) -> Option<&str> {
        self.authn_statements
            .first()
            .and_then(|s| s.session_index.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: String,
    pub in_response_to: Option<String>,
    pub destination: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
    pub status: Status,
    pub assertions: Vec<Assertion>,
    /// Number of `EncryptedAssertion` children still to be decrypted.
    pub encrypted_assertions: usize,
    pub signed: bool,
}

impl Response {
    fn from_node(node: Node) -> Result<Self, Error> {
        let assertions = xml::children(node, ASSERTION_NS, "Assertion")
            .map(Assertion::from_node)
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            id: node.attribute("ID").unwrap_or_default().to_owned(),
            in_response_to: node.attribute("InResponseTo").map(String::from),
            destination: node.attribute("Destination").map(String::from),
            issue_instant: xml::instant_attribute(node, "IssueInstant")?,
            issuer: xml::child_text(node, ASSERTION_NS, "Issuer"),
            status: Status::from_node(xml::child(node, PROTOCOL_NS, "Status")),
            assertions,
            encrypted_assertions: xml::children(node, ASSERTION_NS, "EncryptedAssertion").count(),
            signed: false,
        })
    }

    /// The issuer, falling back to the first assertion's issuer.
    pub fn issuer(&self) -> Option<&str> {
        self.issuer
            .as_deref()
            .or_else(|| self.assertions.iter().find_map(|a| a.issuer.as_deref()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogoutRequest {
    pub id: String,
    pub version: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub name_id: Option<NameId>,
    /// Set when the NameID arrived as an `EncryptedID` and still needs the
    /// service provider key.
    pub encrypted_name_id: bool,
    pub session_indexes: Vec<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub signed: bool,
}

impl LogoutRequest {
    /// A request asking the identity provider to end `name_id`'s session.
    pub fn new(
        issuer: &str,
        destination: &str,
        name_id: NameId,
        session_index: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            version: Some("2.0".into()),
            issue_instant: Some(now()),
            destination: Some(destination.into()),
            issuer: Some(issuer.into()),
            name_id: Some(name_id),
            encrypted_name_id: false,
            session_indexes: session_index.into_iter().collect(),
            not_on_or_after: None,
            signed: false,
        }
    }

    fn from_node(node: Node) -> Result<Self, Error> {
        Ok(Self {
            id: node.attribute("ID").unwrap_or_default().to_owned(),
            version: node.attribute("Version").map(String::from),
            issue_instant: xml::instant_attribute(node, "IssueInstant")?,
            destination: node.attribute("Destination").map(String::from),
            issuer: xml::child_text(node, ASSERTION_NS, "Issuer"),
            name_id: xml::child(node, ASSERTION_NS, "NameID").map(NameId::from_node),
            encrypted_name_id: xml::child(node, ASSERTION_NS, "EncryptedID").is_some(),
            session_indexes: xml::children(node, PROTOCOL_NS, "SessionIndex")
                .filter_map(xml::text)
                .collect(),
            not_on_or_after: xml::instant_attribute(node, "NotOnOrAfter")?,
            signed: false,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogoutResponse {
    pub id: String,
    pub version: Option<String>,
    pub in_response_to: Option<String>,
    pub issue_instant: Option<DateTime<Utc>>,
    pub destination: Option<String>,
    pub issuer: Option<String>,
    pub status: Status,
    pub signed: bool,
}

impl LogoutResponse {
    /// The answer to `request`, sent back to `destination`.
    pub fn new(issuer: &str, destination: &str, in_response_to: &str, status: Status) -> Self {
        Self {
            id: generate_id(),
            version: Some("2.0".into()),
            in_response_to: Some(in_response_to.into()),
            issue_instant: Some(now()),
            destination: Some(destination.into()),
            issuer: Some(issuer.into()),
            status,
            signed: false,
        }
    }

    fn from_node(node: Node) -> Result<Self, Error> {
        Ok(Self {
            id: node.attribute("ID").unwrap_or_default().to_owned(),
            version: node.attribute("Version").map(String::from),
            in_response_to: node.attribute("InResponseTo").map(String::from),
            issue_instant: xml::instant_attribute(node, "IssueInstant")?,
            destination: node.attribute("Destination").map(String::from),
            issuer: xml::child_text(node, ASSERTION_NS, "Issuer"),
            status: Status::from_node(xml::child(node, PROTOCOL_NS, "Status")),
            signed: false,
        })
    }
}

/// Outbound authentication request.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
    pub issuer: String,
    pub assertion_consumer_service_url: String,
    pub force_authn: bool,
    pub name_id_format: Option<String>,
    pub requested_authn_context: Option<String>,
}

/// Every message the service provider accepts from an identity provider.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Response(Response),
    LogoutRequest(LogoutRequest),
    LogoutResponse(LogoutResponse),
}

impl Message {
    /// Parse a protocol message.
    ///
    /// Input that is not XML is [Error::MalformedMessage]; XML whose root is
    /// not one of the accepted messages is [Error::UnknownMessageType].
    pub fn from_xml(input: &str) -> Result<Self, Error> {
        let doc = xml::parse(input)?;
        let root = doc.root_element();
        if root.tag_name().namespace() != Some(PROTOCOL_NS) {
            return Err(Error::UnknownMessageType(root.tag_name().name().to_owned()));
        }
        match root.tag_name().name() {
            "Response" => Ok(Message::Response(Response::from_node(root)?)),
            "LogoutRequest" => Ok(Message::LogoutRequest(LogoutRequest::from_node(root)?)),
            "LogoutResponse" => Ok(Message::LogoutResponse(LogoutResponse::from_node(root)?)),
            other => Err(Error::UnknownMessageType(other.to_owned())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Response(_) => "Response",
            Message::LogoutRequest(_) => "LogoutRequest",
            Message::LogoutResponse(_) => "LogoutResponse",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Message::Response(r) => &r.id,
            Message::LogoutRequest(r) => &r.id,
            Message::LogoutResponse(r) => &r.id,
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        match self {
            Message::Response(r) => r.issuer(),
            Message::LogoutRequest(r) => r.issuer.as_deref(),
            Message::LogoutResponse(r) => r.issuer.as_deref(),
        }
    }

    /// Whether the message as a whole is covered by a verified signature.
    pub fn is_signed(&self) -> bool {
        match self {
            Message::Response(r) => r.signed,
            Message::LogoutRequest(r) => r.signed,
            Message::LogoutResponse(r) => r.signed,
        }
    }

    /// Mark the message and everything in it as signed, used once a
    /// redirect binding signature over the whole message has been verified.
    pub fn mark_signed(&mut self) {
        match self {
            Message::Response(r) => {
                r.signed = true;
                r.assertions.iter_mut().for_each(|a| a.signed = true);
            }
            Message::LogoutRequest(r) => r.signed = true,
            Message::LogoutResponse(r) => r.signed = true,
        }
    }

    /// Record which elements carried a verified enveloped signature.
    pub fn apply_signed_ids(&mut self, signed_ids: &HashSet<String>) {
        match self {
            Message::Response(r) => {
                r.signed = r.signed || signed_ids.contains(&r.id);
                let response_signed = r.signed;
                for assertion in r.assertions.iter_mut() {
                    assertion.signed =
                        assertion.signed || response_signed || signed_ids.contains(&assertion.id);
                }
            }
            Message::LogoutRequest(r) => r.signed = r.signed || signed_ids.contains(&r.id),
            Message::LogoutResponse(r) => r.signed = r.signed || signed_ids.contains(&r.id),
        }
    }
}

/// A message that can travel over the HTTP-Redirect binding.
pub trait RedirectMessage {
    /// Query parameter carrying the message, `SAMLRequest` or `SAMLResponse`.
    const PARAMETER: &'static str;

    fn destination(&self) -> &str;

    fn to_xml(&self) -> Result<String, Error>;
}

impl RedirectMessage for AuthnRequest {
    const PARAMETER: &'static str = "SAMLRequest";

    fn destination(&self) -> &str {
        &self.destination
    }

    fn to_xml(&self) -> Result<String, Error> {
        Ok(AuthnRequestTemplate {
            id: &self.id,
            issue_instant: xml::format_instant(&self.issue_instant),
            destination: &self.destination,
            issuer: &self.issuer,
            assertion_consumer_service_url: &self.assertion_consumer_service_url,
            force_authn: self.force_authn,
            name_id_format: self.name_id_format.as_deref(),
            requested_authn_context: self.requested_authn_context.as_deref(),
        }
        .render()?)
    }
}

impl RedirectMessage for LogoutRequest {
    const PARAMETER: &'static str = "SAMLRequest";

    fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or_default()
    }

    fn to_xml(&self) -> Result<String, Error> {
        let name_id = self
            .name_id
            .as_ref()
            .ok_or_else(|| Error::MalformedMessage("LogoutRequest without NameID".into()))?;
        Ok(LogoutRequestTemplate {
            id: &self.id,
            issue_instant: xml::format_instant(&self.issue_instant.unwrap_or_else(now)),
            destination: self.destination(),
            issuer: self.issuer.as_deref().unwrap_or_default(),
            name_id,
            session_indexes: &self.session_indexes,
        }
        .render()?)
    }
}

impl RedirectMessage for LogoutResponse {
    const PARAMETER: &'static str = "SAMLResponse";

    fn destination(&self) -> &str {
        self.destination.as_deref().unwrap_or_default()
    }

    fn to_xml(&self) -> Result<String, Error> {
        Ok(LogoutResponseTemplate {
            id: &self.id,
            in_response_to: self.in_response_to.as_deref(),
            issue_instant: xml::format_instant(&self.issue_instant.unwrap_or_else(now)),
            destination: self.destination(),
            issuer: self.issuer.as_deref().unwrap_or_default(),
            status: &self.status,
        }
        .render()?)
    }
}
