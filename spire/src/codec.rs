//! HTTP-POST and HTTP-Redirect bindings.
//!
//! Decoding only parses, it never checks signatures. A redirect signature is
//! captured as [RedirectSignature] so the caller can verify it against the
//! identity provider's certificates once it knows who the issuer is.
use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use openssl::pkey::{PKey, Private};
use serde::Deserialize;
use url::form_urlencoded;

use crate::{
    error::Error,
    message::{Message, RedirectMessage},
    signature::{sign_redirect, SignatureAlgorithm},
};

/// Upper bound on an inflated redirect message.
const MAX_INFLATED_SIZE: u64 = 1024 * 1024;

/// Form body of an HTTP-POST binding request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PostForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// The parts of an HTTP-Redirect query covered by its signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectSignature {
    /// `SigAlg` URI as sent.
    pub sig_alg: String,
    pub signature: Vec<u8>,
    /// `SAMLRequest|SAMLResponse=..[&RelayState=..]&SigAlg=..` exactly as it
    /// appeared on the wire.
    pub signed_octets: String,
}

/// A message taken off either binding.
#[derive(Debug)]
pub struct Decoded {
    pub message: Message,
    pub relay_state: Option<String>,
    pub redirect_signature: Option<RedirectSignature>,
    /// The message XML, kept for signature verification and decryption.
    pub xml: String,
}

fn malformed<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> Error + '_ {
    move |e| Error::MalformedMessage(format!("{}: {}", context, e))
}

fn decode_base64(value: &str) -> Result<Vec<u8>, Error> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    base64::decode(compact).map_err(malformed("invalid base64"))
}

fn into_xml(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(malformed("message is not UTF-8"))
}

/// Decode a message posted in the `SAMLResponse` or `SAMLRequest` field.
pub fn decode_post(form: &PostForm) -> Result<Decoded, Error> {
    let encoded = form
        .saml_response
        .as_deref()
        .or_else(|| form.saml_request.as_deref())
        .ok_or_else(|| Error::MalformedMessage("no SAML message in form".into()))?;
    let xml = into_xml(decode_base64(encoded)?)?;
    let message = Message::from_xml(&xml)?;
    Ok(Decoded {
        message,
        relay_state: form.relay_state.clone(),
        redirect_signature: None,
        xml,
    })
}

/// Decode a form encoded value, `+` standing for a space.
fn form_decode(raw: &str) -> String {
    form_urlencoded::parse(format!("v={}", raw).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

/// Percent-decode a base64 or URI value, leaving `+` as it is.
fn percent_decode(raw: &str) -> Result<String, Error> {
    urlencoding::decode(raw)
        .map(|value| value.into_owned())
        .map_err(malformed("invalid percent-encoding"))
}

fn inflate(deflated: &[u8]) -> Result<String, Error> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(deflated)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut inflated)
        .map_err(malformed("invalid deflate stream"))?;
    if inflated.len() as u64 > MAX_INFLATED_SIZE {
        return Err(Error::MalformedMessage("inflated message too large".into()));
    }
    into_xml(inflated)
}

/// Decode a message from the raw query string of an HTTP-Redirect request.
///
/// Signed octets are rebuilt from the undecoded parameter values, the
/// signature covers what was sent rather than any re-encoding of it.
pub fn decode_redirect(raw_query: &str) -> Result<Decoded, Error> {
    let mut message = None;
    let mut relay_state = None;
    let mut sig_alg = None;
    let mut signature = None;
    for pair in raw_query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        match key {
            "SAMLRequest" | "SAMLResponse" => message = Some((key, value)),
            "RelayState" => relay_state = Some(value),
            "SigAlg" => sig_alg = Some(value),
            "Signature" => signature = Some(value),
            _ => {}
        }
    }

    let (parameter, raw_message) =
        message.ok_or_else(|| Error::MalformedMessage("no SAML message in query".into()))?;
    let xml = inflate(&decode_base64(&percent_decode(raw_message)?)?)?;
    let message = Message::from_xml(&xml)?;

    let redirect_signature = match (sig_alg, signature) {
        (Some(raw_alg), Some(raw_signature)) => {
            let mut signed_octets = format!("{}={}", parameter, raw_message);
            if let Some(raw_relay_state) = relay_state {
                signed_octets.push_str("&RelayState=");
                signed_octets.push_str(raw_relay_state);
            }
            signed_octets.push_str("&SigAlg=");
            signed_octets.push_str(raw_alg);
            Some(RedirectSignature {
                sig_alg: percent_decode(raw_alg)?,
                signature: decode_base64(&percent_decode(raw_signature)?)?,
                signed_octets,
            })
        }
        (None, None) => None,
        _ => {
            return Err(Error::MalformedMessage(
                "SigAlg and Signature must be sent together".into(),
            ))
        }
    };

    Ok(Decoded {
        message,
        relay_state: relay_state.map(form_decode),
        redirect_signature,
        xml,
    })
}

fn url_encode(value: &[u8]) -> String {
    form_urlencoded::byte_serialize(value).collect()
}

/// Encode `message` as an HTTP-Redirect URL to its destination, signing the
/// query when a key is given.
pub fn encode_redirect<M: RedirectMessage>(
    message: &M,
    relay_state: Option<&str>,
    signing: Option<(&PKey<Private>, SignatureAlgorithm)>,
) -> Result<String, Error> {
    let xml = message.to_xml()?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(malformed("failed to deflate message"))?;
    let deflated = encoder
        .finish()
        .map_err(malformed("failed to deflate message"))?;

    let mut query = format!(
        "{}={}",
        M::PARAMETER,
        url_encode(base64::encode(deflated).as_bytes())
    );
    if let Some(relay_state) = relay_state {
        query.push_str("&RelayState=");
        query.push_str(&url_encode(relay_state.as_bytes()));
    }
    if let Some((key, alg)) = signing {
        query.push_str("&SigAlg=");
        query.push_str(&url_encode(alg.uri().as_bytes()));
        let signature = sign_redirect(&query, key, alg)?;
        query.push_str("&Signature=");
        query.push_str(&url_encode(base64::encode(signature).as_bytes()));
    }

    let destination = message.destination();
    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", destination, separator, query))
}
