//! Small helpers over [roxmltree] shared by the message parsers, the
//! signature verifier and the decrypter.
use chrono::{DateTime, NaiveDateTime, Utc};
use roxmltree::{Document, Node};

use crate::error::Error;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Parse a document received from the outside world.
///
/// Documents carrying a DTD are refused outright, SAML never needs one and
/// entity expansion is an attack surface.
pub fn parse(xml: &str) -> Result<Document<'_>, Error> {
    if xml.contains("<!DOCTYPE") {
        return Err(Error::MalformedMessage(
            "documents with a DOCTYPE are not accepted".into(),
        ));
    }
    Document::parse(xml).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Whether `node` is the element `{ns}name`.
pub fn is(node: Node, ns: &str, name: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == name
        && node.tag_name().namespace() == Some(ns)
}

/// First child element named `{ns}name`.
pub fn child<'a, 'input>(
    node: Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> Option<Node<'a, 'input>> {
    node.children().find(|c| is(*c, ns, name))
}

/// All child elements named `{ns}name`.
pub fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    ns: &'a str,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |c| is(*c, ns, name))
}

/// Trimmed text content of an element, `None` when empty.
pub fn text(node: Node) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Text of the child element `{ns}name`.
pub fn child_text(node: Node, ns: &str, name: &str) -> Option<String> {
    child(node, ns, name).and_then(text)
}

/// Parse an `xs:dateTime`. Instants without a zone are taken to be UTC.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, Error> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| DateTime::<Utc>::from_utc(naive, Utc))
        })
        .map_err(|_| Error::MalformedMessage(format!("invalid instant {:?}", value)))
}

/// Parse an optional instant attribute.
pub fn instant_attribute(node: Node, name: &str) -> Result<Option<DateTime<Utc>>, Error> {
    node.attribute(name).map(parse_instant).transpose()
}

/// Render an instant the way SAML expects it.
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Position of `node` among the document's elements, in document order.
///
/// The canonicaliser streams the raw text, this is how a node found in the
/// tree is located in that stream.
pub fn element_ordinal<'a, 'input>(
    doc: &'a Document<'input>,
    node: Node<'a, 'input>,
) -> Option<usize> {
    doc.descendants()
        .filter(|n| n.is_element())
        .position(|n| n == node)
}

/// Find the element whose `ID` attribute is `id`.
///
/// Fails if more than one element claims the ID, a document like that is
/// how signature wrapping attacks are smuggled in.
pub fn element_by_id<'a>(doc: &'a Document<'a>, id: &str) -> Result<Option<Node<'a, 'a>>, Error> {
    let mut found = doc
        .descendants()
        .filter(|n| n.is_element() && n.attribute("ID") == Some(id));
    let first = found.next();
    if found.next().is_some() {
        return Err(Error::MalformedMessage(format!("duplicate ID {}", id)));
    }
    Ok(first)
}
