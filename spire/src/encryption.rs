//! XML Encryption, the receiving half only.
//!
//! The IdP encrypts a fresh symmetric key to our certificate and the element
//! (`Assertion` or `NameID`) with that key. Decrypted elements are returned
//! as standalone documents; the namespaces in scope where the ciphertext sat
//! are redeclared on a wrapper element so prefixes keep resolving.
use std::collections::HashSet;

use openssl::{
    encrypt::Decrypter,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{decrypt_aead, Cipher, Crypter, Mode},
    x509::X509,
};
use roxmltree::Node;

use crate::{
    codec::Decoded,
    error::Error,
    message::{Assertion, Message, NameId},
    signature::verify_signature,
    xml::{self, ASSERTION_NS, DSIG_NS, XENC_NS},
};

const XENC11_NS: &str = "http://www.w3.org/2009/xmlenc11#";

const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";

const WRAPPER_NS: &str = "urn:spire:decrypted";

fn failed<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::DecryptionFailed(format!("{}: {}", context, e))
}

fn missing(what: &str) -> Error {
    Error::DecryptionFailed(format!("missing {}", what))
}

fn cipher_value(node: Node) -> Result<Vec<u8>, Error> {
    let value = xml::child(node, XENC_NS, "CipherData")
        .and_then(|data| xml::child_text(data, XENC_NS, "CipherValue"))
        .ok_or_else(|| missing("CipherValue"))?;
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    base64::decode(compact).map_err(failed("invalid CipherValue"))
}

fn method<'a, 'input>(node: Node<'a, 'input>) -> Result<(Node<'a, 'input>, &'a str), Error> {
    let method =
        xml::child(node, XENC_NS, "EncryptionMethod").ok_or_else(|| missing("EncryptionMethod"))?;
    let algorithm = method
        .attribute("Algorithm")
        .ok_or_else(|| missing("encryption algorithm"))?;
    Ok((method, algorithm))
}

fn oaep_digest(uri: Option<&str>) -> Result<MessageDigest, Error> {
    match uri {
        None | Some("http://www.w3.org/2000/09/xmldsig#sha1") => Ok(MessageDigest::sha1()),
        Some("http://www.w3.org/2001/04/xmlenc#sha256") => Ok(MessageDigest::sha256()),
        Some("http://www.w3.org/2001/04/xmldsig-more#sha384") => Ok(MessageDigest::sha384()),
        Some("http://www.w3.org/2001/04/xmlenc#sha512") => Ok(MessageDigest::sha512()),
        Some(other) => Err(Error::DecryptionFailed(format!(
            "unsupported OAEP digest {}",
            other
        ))),
    }
}

fn mgf1_digest(uri: Option<&str>) -> Result<MessageDigest, Error> {
    match uri {
        None | Some("http://www.w3.org/2009/xmlenc11#mgf1sha1") => Ok(MessageDigest::sha1()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha256") => Ok(MessageDigest::sha256()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha384") => Ok(MessageDigest::sha384()),
        Some("http://www.w3.org/2009/xmlenc11#mgf1sha512") => Ok(MessageDigest::sha512()),
        Some(other) => Err(Error::DecryptionFailed(format!(
            "unsupported MGF {}",
            other
        ))),
    }
}

/// Recover the symmetric key from an `EncryptedKey`.
fn decrypt_key(encrypted_key: Node, key: &PKey<Private>) -> Result<Vec<u8>, Error> {
    let (method, algorithm) = method(encrypted_key)?;
    let wrapped = cipher_value(encrypted_key)?;

    let mut decrypter = Decrypter::new(key)?;
    match algorithm {
        RSA_OAEP_MGF1P | RSA_OAEP => {
            decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
            let digest = xml::child(method, DSIG_NS, "DigestMethod")
                .and_then(|n| n.attribute("Algorithm"));
            decrypter.set_rsa_oaep_md(oaep_digest(digest)?)?;
            let mgf = if algorithm == RSA_OAEP {
                xml::child(method, XENC11_NS, "MGF").and_then(|n| n.attribute("Algorithm"))
            } else {
                None
            };
            decrypter.set_rsa_mgf1_md(mgf1_digest(mgf)?)?;
        }
        RSA_1_5 => decrypter.set_rsa_padding(Padding::PKCS1)?,
        other => {
            return Err(Error::DecryptionFailed(format!(
                "unsupported key transport {}",
                other
            )))
        }
    }

    let mut out = vec![0; decrypter.decrypt_len(&wrapped)?];
    let len = decrypter
        .decrypt(&wrapped, &mut out)
        .map_err(failed("could not decrypt key"))?;
    out.truncate(len);
    Ok(out)
}

enum DataCipher {
    Cbc(Cipher),
    Gcm(Cipher),
}

fn data_cipher(uri: &str) -> Result<DataCipher, Error> {
    match uri {
        "http://www.w3.org/2001/04/xmlenc#aes128-cbc" => Ok(DataCipher::Cbc(Cipher::aes_128_cbc())),
        "http://www.w3.org/2001/04/xmlenc#aes192-cbc" => Ok(DataCipher::Cbc(Cipher::aes_192_cbc())),
        "http://www.w3.org/2001/04/xmlenc#aes256-cbc" => Ok(DataCipher::Cbc(Cipher::aes_256_cbc())),
        "http://www.w3.org/2009/xmlenc11#aes128-gcm" => Ok(DataCipher::Gcm(Cipher::aes_128_gcm())),
        "http://www.w3.org/2009/xmlenc11#aes256-gcm" => Ok(DataCipher::Gcm(Cipher::aes_256_gcm())),
        other => Err(Error::DecryptionFailed(format!(
            "unsupported data encryption {}",
            other
        ))),
    }
}

fn decrypt_data(cipher: DataCipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    match cipher {
        DataCipher::Cbc(cipher) => {
            let block = cipher.block_size();
            if key.len() != cipher.key_len() || data.len() < 2 * block || data.len() % block != 0 {
                return Err(Error::DecryptionFailed("bad CBC key or ciphertext length".into()));
            }
            let (iv, ciphertext) = data.split_at(block);
            let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))
                .map_err(failed("bad CBC parameters"))?;
            // XML Encryption padding is only defined by its last byte.
            crypter.pad(false);
            let mut plain = vec![0; ciphertext.len() + block];
            let mut len = crypter
                .update(ciphertext, &mut plain)
                .map_err(failed("CBC decryption failed"))?;
            len += crypter
                .finalize(&mut plain[len..])
                .map_err(failed("CBC decryption failed"))?;
            plain.truncate(len);
            let padding = plain.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > block || padding > plain.len() {
                return Err(Error::DecryptionFailed("bad padding".into()));
            }
            plain.truncate(plain.len() - padding);
            Ok(plain)
        }
        DataCipher::Gcm(cipher) => {
            const IV_LEN: usize = 12;
            const TAG_LEN: usize = 16;
            if key.len() != cipher.key_len() || data.len() < IV_LEN + TAG_LEN {
                return Err(Error::DecryptionFailed("bad GCM key or ciphertext length".into()));
            }
            let (iv, rest) = data.split_at(IV_LEN);
            let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
            decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag)
                .map_err(failed("GCM decryption failed"))
        }
    }
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

/// Decrypt the `EncryptedData` inside `container`, an `EncryptedAssertion`
/// or `EncryptedID`, returning the plaintext wrapped in an element that
/// redeclares the namespaces in scope at `container`.
pub fn decrypt_element(container: Node, key: &PKey<Private>) -> Result<String, Error> {
    let data = xml::child(container, XENC_NS, "EncryptedData")
        .ok_or_else(|| missing("EncryptedData"))?;
    let (_, algorithm) = method(data)?;
    let cipher = data_cipher(algorithm)?;

    let encrypted_key = xml::child(data, DSIG_NS, "KeyInfo")
        .and_then(|info| xml::child(info, XENC_NS, "EncryptedKey"))
        .or_else(|| xml::child(container, XENC_NS, "EncryptedKey"))
        .ok_or_else(|| missing("EncryptedKey"))?;
    let symmetric_key = decrypt_key(encrypted_key, key)?;
    let plain = decrypt_data(cipher, &symmetric_key, &cipher_value(data)?)?;
    let plain = String::from_utf8(plain).map_err(failed("plaintext is not UTF-8"))?;

    let mut wrapped = format!("<spire:decrypted xmlns:spire=\"{}\"", WRAPPER_NS);
    for ns in container.namespaces() {
        match ns.name() {
            Some("xml") | Some("spire") => {}
            Some(prefix) => {
                wrapped.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape_attribute(ns.uri())))
            }
            None => wrapped.push_str(&format!(" xmlns=\"{}\"", escape_attribute(ns.uri()))),
        }
    }
    wrapped.push('>');
    wrapped.push_str(&plain);
    wrapped.push_str("</spire:decrypted>");
    Ok(wrapped)
}

/// Decrypt an `EncryptedAssertion` and verify any signature inside it.
///
/// With no certificates the assertion comes back unsigned and the caller's
/// signature policy decides what that means.
pub fn decrypt_assertion(
    container: Node,
    key: &PKey<Private>,
    certs: &[X509],
) -> Result<Assertion, Error> {
    let wrapped = decrypt_element(container, key)?;
    let doc = xml::parse(&wrapped).map_err(failed("decrypted data is not XML"))?;
    let signed_ids = if certs.is_empty() {
        HashSet::new()
    } else {
        verify_signature(&wrapped, certs)?
    };
    let mut assertion = Assertion::from_document(&doc)?;
    assertion.signed = signed_ids.contains(&assertion.id);
    Ok(assertion)
}

/// Decrypt an `EncryptedID` into the NameID it hides.
pub fn decrypt_name_id(container: Node, key: &PKey<Private>) -> Result<NameId, Error> {
    let wrapped = decrypt_element(container, key)?;
    let doc = xml::parse(&wrapped).map_err(failed("decrypted data is not XML"))?;
    doc.descendants()
        .find(|n| xml::is(*n, ASSERTION_NS, "NameID"))
        .map(NameId::from_node)
        .ok_or_else(|| missing("NameID in EncryptedID"))
}

impl Decoded {
    /// Replace encrypted parts of the message with their plaintext.
    ///
    /// Run after the outer signature has been checked: a decrypted assertion
    /// counts as signed when the response around it was.
    pub fn decrypt(&mut self, key: &PKey<Private>, certs: &[X509]) -> Result<(), Error> {
        let doc = xml::parse(&self.xml)?;
        let root = doc.root_element();
        match &mut self.message {
            Message::Response(response) if response.encrypted_assertions > 0 => {
                for container in xml::children(root, ASSERTION_NS, "EncryptedAssertion") {
                    let mut assertion = decrypt_assertion(container, key, certs)?;
                    assertion.signed = assertion.signed || response.signed;
                    response.assertions.push(assertion);
                }
                response.encrypted_assertions = 0;
            }
            Message::LogoutRequest(request) if request.encrypted_name_id => {
                let container = xml::child(root, ASSERTION_NS, "EncryptedID")
                    .ok_or_else(|| missing("EncryptedID"))?;
                request.name_id = Some(decrypt_name_id(container, key)?);
                request.encrypted_name_id = false;
            }
            _ => {}
        }
        Ok(())
    }
}
