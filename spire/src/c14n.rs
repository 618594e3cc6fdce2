// This is an implementation exclusive [XML
// canonicalization](https://www.w3.org/TR/xml-exc-c14n/), without comments.
//
// It works on the raw document text rather than the parsed tree because the
// output depends on the namespace prefixes as written, which roxmltree does not
// keep. Elements are addressed by their position in document order, see
// `xml::element_ordinal`.
use std::collections::{BTreeMap, BTreeSet};

use quick_xml::{
    escape::unescape,
    events::{BytesStart, Event},
    Reader,
};

use crate::{error::Error, xml::XML_NS};

struct Element {
    qname: String,
    prefix: String,
    namespaces: Vec<(String, String)>,
    attributes: Vec<Attribute>,
}

struct Attribute {
    qname: String,
    prefix: String,
    local: String,
    value: String,
}

fn malformed<E: std::fmt::Display>(e: E) -> Error {
    Error::MalformedMessage(format!("canonicalization failed: {}", e))
}

fn utf8(bytes: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(bytes).map_err(malformed)
}

fn split_qname(qname: &str) -> (&str, &str) {
    match qname.find(':') {
        Some(idx) => (&qname[..idx], &qname[idx + 1..]),
        None => ("", qname),
    }
}

// Attribute value normalisation as a parser would do it: literal whitespace
// becomes a space, character references survive.
fn attribute_value(raw: &str) -> Result<String, Error> {
    let normalized: String = raw
        .replace("\r\n", "\n")
        .chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' => ' ',
            c => c,
        })
        .collect();
    Ok(unescape(&normalized).map_err(malformed)?.into_owned())
}

fn text_value(raw: &str) -> Result<String, Error> {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    Ok(unescape(&normalized).map_err(malformed)?.into_owned())
}

fn read_element(start: &BytesStart) -> Result<Element, Error> {
    let qname = utf8(start.name().as_ref())?.to_owned();
    let prefix = split_qname(&qname).0.to_owned();
    let mut namespaces = Vec::new();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = utf8(attr.key.as_ref())?;
        let value = attribute_value(utf8(&attr.value)?)?;
        if key == "xmlns" {
            namespaces.push((String::new(), value));
        } else if let Some(declared) = key.strip_prefix("xmlns:") {
            namespaces.push((declared.to_owned(), value));
        } else {
            let (prefix, local) = split_qname(key);
            attributes.push(Attribute {
                qname: key.to_owned(),
                prefix: prefix.to_owned(),
                local: local.to_owned(),
                value,
            });
        }
    }
    Ok(Element {
        qname,
        prefix,
        namespaces,
        attributes,
    })
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

/// Namespace declarations in scope, innermost last.
struct Scopes(Vec<Vec<(String, String)>>);

impl Scopes {
    fn lookup(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.0
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(declared, _)| declared == prefix)
            .map(|(_, uri)| uri.as_str())
    }
}

fn render_start(
    element: &Element,
    scopes: &Scopes,
    parent: Option<&BTreeMap<String, String>>,
    inclusive_prefixes: &[String],
    out: &mut String,
) -> Result<BTreeMap<String, String>, Error> {
    let mut utilized = BTreeSet::new();
    utilized.insert(element.prefix.clone());
    for attr in &element.attributes {
        if !attr.prefix.is_empty() && attr.prefix != "xml" {
            utilized.insert(attr.prefix.clone());
        }
    }
    for prefix in inclusive_prefixes {
        let prefix = if prefix == "#default" { "" } else { prefix.as_str() };
        if scopes.lookup(prefix).is_some() {
            utilized.insert(prefix.to_owned());
        }
    }

    let mut rendered = parent.cloned().unwrap_or_default();
    let mut declarations = Vec::new();
    for prefix in utilized {
        let uri = scopes.lookup(&prefix).unwrap_or("");
        let current = rendered.get(&prefix).map(String::as_str);
        if prefix.is_empty() {
            if uri != current.unwrap_or("") {
                declarations.push((prefix.clone(), uri.to_owned()));
            }
        } else {
            if uri.is_empty() {
                return Err(malformed(format!("undeclared prefix {}", prefix)));
            }
            if current != Some(uri) {
                declarations.push((prefix.clone(), uri.to_owned()));
            }
        }
        rendered.insert(prefix, uri.to_owned());
    }

    let mut attributes: Vec<(&str, &Attribute)> = element
        .attributes
        .iter()
        .map(|attr| {
            let uri = if attr.prefix.is_empty() {
                ""
            } else {
                scopes.lookup(&attr.prefix).unwrap_or("")
            };
            (uri, attr)
        })
        .collect();
    attributes.sort_by(|(a_uri, a), (b_uri, b)| (a_uri, &a.local).cmp(&(b_uri, &b.local)));

    out.push('<');
    out.push_str(&element.qname);
    for (prefix, uri) in declarations {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(&prefix);
            out.push_str("=\"");
        }
        escape_attribute(&uri, out);
        out.push('"');
    }
    for (_, attr) in attributes {
        out.push(' ');
        out.push_str(&attr.qname);
        out.push_str("=\"");
        escape_attribute(&attr.value, out);
        out.push('"');
    }
    out.push('>');
    Ok(rendered)
}

/// Canonicalize the element at position `target` (document order, counting
/// elements only), leaving out the subtree of the element at position
/// `exclude`. `inclusive_prefixes` is the `PrefixList` of an
/// `InclusiveNamespaces` element, `#default` naming the default namespace.
pub fn canonicalize(
    xml: &str,
    target: usize,
    exclude: Option<usize>,
    inclusive_prefixes: &[String],
) -> Result<String, Error> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut scopes = Scopes(Vec::new());
    let mut rendered: Vec<BTreeMap<String, String>> = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut ordinal = 0;
    let mut skip_depth = 0;

    loop {
        let (start, is_empty) = match reader.read_event().map_err(malformed)? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => {
                scopes.0.pop();
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else if let Some(qname) = open.pop() {
                    out.push_str("</");
                    out.push_str(&qname);
                    out.push('>');
                    rendered.pop();
                    if open.is_empty() {
                        return Ok(out);
                    }
                }
                continue;
            }
            Event::Text(e) => {
                if !open.is_empty() && skip_depth == 0 {
                    escape_text(&text_value(utf8(&e)?)?, &mut out);
                }
                continue;
            }
            Event::CData(e) => {
                if !open.is_empty() && skip_depth == 0 {
                    escape_text(utf8(&e)?, &mut out);
                }
                continue;
            }
            Event::DocType(_) => return Err(malformed("DOCTYPE is not supported")),
            Event::Eof => {
                return Err(malformed(format!("element {} not found", target)));
            }
            _ => continue,
        };

        let current = ordinal;
        ordinal += 1;
        let element = read_element(&start)?;
        scopes.0.push(element.namespaces.clone());

        let excluded = skip_depth > 0 || (!open.is_empty() && Some(current) == exclude);
        let outside = open.is_empty() && current != target;
        if excluded || outside {
            if is_empty {
                scopes.0.pop();
            } else if excluded {
                skip_depth += 1;
            }
            continue;
        }

        let map = render_start(
            &element,
            &scopes,
            rendered.last(),
            inclusive_prefixes,
            &mut out,
        )?;
        if is_empty {
            scopes.0.pop();
            out.push_str("</");
            out.push_str(&element.qname);
            out.push('>');
            if open.is_empty() {
                return Ok(out);
            }
        } else {
            rendered.push(map);
            open.push(element.qname);
        }
    }
}
