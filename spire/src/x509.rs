use chrono::{DateTime, Duration, TimeZone, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509NameBuilder, X509},
};

use crate::error::Error;

/// Generate a self-signed certificate and its private key, valid for a year.
pub fn generate_cert(
    common_name: &str,
    bits: u32,
) -> Result<(X509, PKey<Private>, DateTime<Utc>), Error> {
    let expiry = Utc::now() + Duration::days(365);
    let rsa = Rsa::generate(bits)?;
    let pk = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::from_unix(expiry.timestamp())?.as_ref())?;
    builder.set_pubkey(&pk)?;
    builder.sign(&pk, MessageDigest::sha256())?;

    Ok((builder.build(), pk, expiry))
}

/// Parse a certificate given either as PEM or as bare base64 DER, the way it
/// appears inside `ds:X509Certificate`.
pub fn parse_certificate(value: &str) -> Result<X509, Error> {
    let value = value.trim();
    if value.starts_with("-----BEGIN") {
        return X509::from_pem(value.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("invalid certificate: {}", e)));
    }
    let der: Vec<u8> = base64::decode(
        value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>(),
    )
    .map_err(|e| Error::InvalidConfig(format!("invalid certificate encoding: {}", e)))?;
    X509::from_der(&der).map_err(|e| Error::InvalidConfig(format!("invalid certificate: {}", e)))
}

/// Parse a PEM private key (PKCS#8 or PKCS#1).
pub fn parse_private_key(pem: &str) -> Result<PKey<Private>, Error> {
    PKey::private_key_from_pem(pem.trim().as_bytes())
        .map_err(|e| Error::InvalidConfig(format!("invalid private key: {}", e)))
}

/// When `cert` stops being valid.
pub fn not_after(cert: &X509) -> Result<DateTime<Utc>, Error> {
    let now = Utc::now().timestamp();
    let remaining = Asn1Time::from_unix(now)?.diff(cert.not_after())?;
    Ok(Utc.timestamp(now, 0)
        + Duration::days(i64::from(remaining.days))
        + Duration::seconds(i64::from(remaining.secs)))
}

/// Base64 DER of a certificate, as published in metadata.
pub fn certificate_base64(cert: &X509) -> Result<String, Error> {
    Ok(base64::encode(cert.to_der()?))
}
