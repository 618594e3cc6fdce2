//! XML-DSig enveloped signature verification and HTTP-Redirect query
//! signatures.
use std::collections::HashSet;

use openssl::{
    hash::{hash, MessageDigest},
    memcmp,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::{
    c14n,
    codec::{Decoded, RedirectSignature},
    error::Error,
    xml::{self, DSIG_NS},
};

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        [
            SignatureAlgorithm::RsaSha1,
            SignatureAlgorithm::RsaSha256,
            SignatureAlgorithm::RsaSha384,
            SignatureAlgorithm::RsaSha512,
        ]
        .iter()
        .copied()
        .find(|alg| alg.uri() == uri)
        .ok_or_else(|| Error::InvalidSignature(format!("unsupported signature algorithm {}", uri)))
    }

    pub fn digest(self) -> MessageDigest {
        match self {
            SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
            SignatureAlgorithm::RsaSha256 => MessageDigest::sha256(),
            SignatureAlgorithm::RsaSha384 => MessageDigest::sha384(),
            SignatureAlgorithm::RsaSha512 => MessageDigest::sha512(),
        }
    }

    /// `DigestMethod` paired with this algorithm when signing.
    pub fn digest_uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }
}

fn digest_from_uri(uri: &str) -> Result<MessageDigest, Error> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmlenc#sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(MessageDigest::sha512()),
        other => Err(Error::InvalidSignature(format!(
            "unsupported digest algorithm {}",
            other
        ))),
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidSignature(message.into())
}

fn decode_base64(value: &str) -> Result<Vec<u8>, Error> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    base64::decode(compact).map_err(|e| Error::InvalidSignature(format!("bad base64: {}", e)))
}

fn algorithm<'a, 'input>(node: Option<Node<'a, 'input>>) -> Option<&'a str> {
    node.and_then(|n| n.attribute("Algorithm"))
}

/// `PrefixList` of an `InclusiveNamespaces` child, if any.
fn inclusive_prefixes(node: Node) -> Vec<String> {
    xml::child(node, EXC_C14N, "InclusiveNamespaces")
        .and_then(|n| n.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}

/// Whether any certificate in the set produced `signature` over `data`.
///
/// A certificate that fails to load or verify simply does not match, so the
/// result does not depend on where the signing certificate sits in the set.
pub fn verify_with_any(
    certs: &[X509],
    alg: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> bool {
    certs.iter().any(|cert| {
        let verified = || -> Result<bool, openssl::error::ErrorStack> {
            let public = cert.public_key()?;
            let mut verifier = Verifier::new(alg.digest(), &public)?;
            verifier.update(data)?;
            verifier.verify(signature)
        };
        verified().unwrap_or(false)
    })
}

fn verify_one<'a, 'input>(
    raw: &str,
    doc: &'a Document<'input>,
    signature: Node<'a, 'input>,
    certs: &[X509],
) -> Result<String, Error> {
    let parent = signature
        .parent_element()
        .ok_or_else(|| invalid("signature has no parent element"))?;
    let id = parent
        .attribute("ID")
        .ok_or_else(|| invalid("signed element has no ID"))?;
    match xml::element_by_id(doc, id)? {
        Some(found) if found == parent => {}
        _ => return Err(invalid("signed element cannot be located by its ID")),
    }

    let signed_info = xml::child(signature, DSIG_NS, "SignedInfo")
        .ok_or_else(|| invalid("missing SignedInfo"))?;
    let c14n_method = xml::child(signed_info, DSIG_NS, "CanonicalizationMethod");
    if algorithm(c14n_method) != Some(EXC_C14N) {
        return Err(invalid("SignedInfo must use exclusive canonicalization"));
    }
    let alg = SignatureAlgorithm::from_uri(
        algorithm(xml::child(signed_info, DSIG_NS, "SignatureMethod"))
            .ok_or_else(|| invalid("missing SignatureMethod"))?,
    )?;

    let mut references = xml::children(signed_info, DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| invalid("missing Reference"))?;
    if references.next().is_some() {
        return Err(invalid("only a single Reference is supported"));
    }
    if reference.attribute("URI") != Some(format!("#{}", id).as_str()) {
        return Err(invalid("Reference does not point at the enclosing element"));
    }

    let mut enveloped = false;
    let mut prefixes = Vec::new();
    if let Some(transforms) = xml::child(reference, DSIG_NS, "Transforms") {
        for transform in xml::children(transforms, DSIG_NS, "Transform") {
            match transform.attribute("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => enveloped = true,
                Some(EXC_C14N) => prefixes = inclusive_prefixes(transform),
                other => {
                    return Err(Error::InvalidSignature(format!(
                        "unsupported transform {:?}",
                        other
                    )))
                }
            }
        }
    }
    if !enveloped {
        return Err(invalid("only enveloped signatures are supported"));
    }

    let digest = digest_from_uri(
        algorithm(xml::child(reference, DSIG_NS, "DigestMethod"))
            .ok_or_else(|| invalid("missing DigestMethod"))?,
    )?;
    let expected_digest = decode_base64(
        &xml::child_text(reference, DSIG_NS, "DigestValue")
            .ok_or_else(|| invalid("missing DigestValue"))?,
    )?;

    let ordinal = |node: Node<'a, 'input>| {
        xml::element_ordinal(doc, node).ok_or_else(|| invalid("lost element"))
    };
    let canonical = c14n::canonicalize(raw, ordinal(parent)?, Some(ordinal(signature)?), &prefixes)?;
    let actual_digest = hash(digest, canonical.as_bytes())?;
    if actual_digest.len() != expected_digest.len()
        || !memcmp::eq(&actual_digest, &expected_digest)
    {
        return Err(invalid("digest mismatch"));
    }

    let signed_info_prefixes = c14n_method.map(inclusive_prefixes).unwrap_or_default();
    let canonical_signed_info =
        c14n::canonicalize(raw, ordinal(signed_info)?, None, &signed_info_prefixes)?;
    let signature_value = decode_base64(
        &xml::child_text(signature, DSIG_NS, "SignatureValue")
            .ok_or_else(|| invalid("missing SignatureValue"))?,
    )?;
    if !verify_with_any(certs, alg, canonical_signed_info.as_bytes(), &signature_value) {
        return Err(invalid("no configured certificate validates the signature"));
    }
    Ok(id.to_owned())
}

/// Verify every enveloped signature in `raw` against `certs`, returning the
/// IDs of the elements they cover.
///
/// An empty set means the document carried no signature at all. A signature
/// that is present but does not verify fails the whole document.
pub fn verify_signature(raw: &str, certs: &[X509]) -> Result<HashSet<String>, Error> {
    let doc = xml::parse(raw)?;
    let mut signed = HashSet::new();
    for signature in doc
        .descendants()
        .filter(|n| xml::is(*n, DSIG_NS, "Signature"))
    {
        if certs.is_empty() {
            return Err(invalid("no certificate to verify the signature with"));
        }
        signed.insert(verify_one(raw, &doc, signature, certs)?);
    }
    Ok(signed)
}

/// Verify an HTTP-Redirect query signature.
pub fn verify_redirect_signature(
    signature: &RedirectSignature,
    certs: &[X509],
) -> Result<(), Error> {
    let alg = SignatureAlgorithm::from_uri(&signature.sig_alg)?;
    if verify_with_any(
        certs,
        alg,
        signature.signed_octets.as_bytes(),
        &signature.signature,
    ) {
        Ok(())
    } else {
        Err(invalid("query signature does not verify"))
    }
}

/// Sign the octets of an HTTP-Redirect query.
pub fn sign_redirect(
    octets: &str,
    key: &PKey<Private>,
    alg: SignatureAlgorithm,
) -> Result<Vec<u8>, Error> {
    let mut signer = Signer::new(alg.digest(), key)?;
    signer.update(octets.as_bytes())?;
    Ok(signer.sign_to_vec()?)
}

/// Outcome of checking a decoded message for signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    Absent,
}

impl Decoded {
    /// Verify whatever signatures the message carries, query signature and
    /// enveloped XML signatures alike, and mark the covered parts signed.
    pub fn verify_signature(&mut self, certs: &[X509]) -> Result<SignatureCheck, Error> {
        let mut check = SignatureCheck::Absent;
        if let Some(signature) = &self.redirect_signature {
            verify_redirect_signature(signature, certs)?;
            self.message.mark_signed();
            check = SignatureCheck::Verified;
        }
        let signed_ids = verify_signature(&self.xml, certs)?;
        if !signed_ids.is_empty() {
            self.message.apply_signed_ids(&signed_ids);
            check = SignatureCheck::Verified;
        }
        Ok(check)
    }
}
