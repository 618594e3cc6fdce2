//! Fixtures shared by the unit tests: key material, configuration and the
//! IdP side of the protocol (signed and encrypted responses).
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use openssl::{
    encrypt::Encrypter,
    hash::{hash, MessageDigest},
    pkey::{PKey, Private},
    rand::rand_bytes,
    rsa::Padding,
    sign::Signer,
    symm::{encrypt, encrypt_aead, Cipher},
    x509::X509,
};
use url::form_urlencoded;

use crate::{
    c14n,
    config::{Config, IdentityProviderConfig, Settings, TenantConfig},
    message::{NameId, STATUS_SUCCESS},
    signature::{SignatureAlgorithm, ENVELOPED_SIGNATURE, EXC_C14N},
    x509::generate_cert,
    xml::{self, ASSERTION_NS, DSIG_NS, PROTOCOL_NS, XENC_NS},
};

pub const BASE_URL: &str = "https://sp.example.com";
pub const TENANT: &str = "acme";
pub const SP_ENTITY_ID: &str = "https://sp.example.com/acme/saml2";
pub const ACS_URL: &str = "https://sp.example.com/acme/login/saml";
pub const IDP_ID: &str = "okta";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/metadata";
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";
pub const IDP_SLO_URL: &str = "https://idp.example.com/slo";

pub struct KeyPair {
    pub key: PKey<Private>,
    pub cert: X509,
}

impl KeyPair {
    fn generate(name: &str) -> Self {
        let (cert, key, _) = generate_cert(name, 2048).expect("failed to generate test key");
        Self { key, cert }
    }

    pub fn cert_pem(&self) -> String {
        String::from_utf8(self.cert.to_pem().unwrap()).unwrap()
    }

    pub fn key_pem(&self) -> String {
        String::from_utf8(self.key.private_key_to_pem_pkcs8().unwrap()).unwrap()
    }
}

static IDP_KEY: Lazy<KeyPair> = Lazy::new(|| KeyPair::generate("idp.example.com"));
static SP_KEY: Lazy<KeyPair> = Lazy::new(|| KeyPair::generate("sp.example.com"));
static OTHER_KEY: Lazy<KeyPair> = Lazy::new(|| KeyPair::generate("mallory.example.com"));

/// The identity provider's signing key.
pub fn idp_key() -> &'static KeyPair {
    &IDP_KEY
}

/// The service provider's key, used for request signing and decryption.
pub fn sp_key() -> &'static KeyPair {
    &SP_KEY
}

/// A key nobody trusts.
pub fn other_key() -> &'static KeyPair {
    &OTHER_KEY
}

pub fn idp_config() -> IdentityProviderConfig {
    IdentityProviderConfig {
        id: IDP_ID.into(),
        entity_id: IDP_ENTITY_ID.into(),
        sso_url: IDP_SSO_URL.into(),
        slo_url: Some(IDP_SLO_URL.into()),
        certificates: vec![idp_key().cert_pem()],
        signature_algorithm: Some(SignatureAlgorithm::RsaSha256),
        login_attribute: "NameID".into(),
        name_id_format: None,
        requested_authn_context: None,
        federated_attributes: Default::default(),
        ignore_audience_condition: false,
        ignore_slo_schema_errors: false,
        jit_provisioning: false,
        strip_domain_from_login_attribute: false,
        debugging: false,
    }
}

pub fn config() -> Config {
    Config {
        base_url: BASE_URL.into(),
        private_key: Some(sp_key().key_pem()),
        certificate: Some(sp_key().cert_pem()),
        request_ttl_secs: 300,
        session_lifetime_secs: 3600,
        clock_skew_secs: 180,
        prevent_assertion_replay: false,
        login_path: "/login".into(),
        default_redirect: "/".into(),
        tenants: vec![TenantConfig {
            id: TENANT.into(),
            entity_id: None,
            identity_providers: vec![idp_config()],
            identities: vec![],
        }],
    }
}

pub fn settings() -> Settings {
    Settings::new(config()).expect("test settings are valid")
}

/// A login response as an identity provider would send it.
#[derive(Clone, Debug)]
pub struct ResponseFixture {
    pub response_id: String,
    pub assertion_id: String,
    pub in_response_to: Option<String>,
    pub issuer: String,
    pub name_id: NameId,
    pub audience: String,
    pub destination: String,
    pub issue_instant: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub status_code: String,
    pub include_assertion: bool,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl ResponseFixture {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            response_id: format!("_r{}", uuid::Uuid::new_v4().to_simple()),
            assertion_id: format!("_a{}", uuid::Uuid::new_v4().to_simple()),
            in_response_to: Some(format!("_q{}", uuid::Uuid::new_v4().to_simple())),
            issuer: IDP_ENTITY_ID.into(),
            name_id: NameId {
                value: "alice@example.com".into(),
                format: Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".into()),
                name_qualifier: None,
                sp_name_qualifier: None,
            },
            audience: SP_ENTITY_ID.into(),
            destination: ACS_URL.into(),
            issue_instant: now,
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(5),
            status_code: STATUS_SUCCESS.into(),
            include_assertion: true,
            attributes: vec![
                ("email".into(), vec!["alice@example.com".into()]),
                ("groups".into(), vec!["staff".into(), "admins".into()]),
            ],
        }
    }

    fn in_response_to_attribute(&self) -> String {
        self.in_response_to
            .as_ref()
            .map(|id| format!(" InResponseTo=\"{}\"", id))
            .unwrap_or_default()
    }

    /// The assertion on its own, declaring the namespaces it uses.
    pub fn render_assertion(&self) -> String {
        let format = self
            .name_id
            .format
            .as_ref()
            .map(|f| format!(" Format=\"{}\"", f))
            .unwrap_or_default();
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<saml:AttributeValue>{}</saml:AttributeValue>", v))
                    .collect();
                format!("<saml:Attribute Name=\"{}\">{}</saml:Attribute>", name, values)
            })
            .collect();
        format!(
            r#"<saml:Assertion xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}"><saml:Issuer>{issuer}</saml:Issuer><saml:Subject><saml:NameID{format}>{name_id}</saml:NameID><saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData NotOnOrAfter="{not_on_or_after}" Recipient="{destination}"{in_response_to}/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}"><saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement AuthnInstant="{instant}" SessionIndex="session-1"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement><saml:AttributeStatement>{attributes}</saml:AttributeStatement></saml:Assertion>"#,
            saml = ASSERTION_NS,
            id = self.assertion_id,
            instant = xml::format_instant(&self.issue_instant),
            issuer = self.issuer,
            format = format,
            name_id = self.name_id.value,
            not_on_or_after = xml::format_instant(&self.not_on_or_after),
            not_before = xml::format_instant(&self.not_before),
            destination = self.destination,
            in_response_to = self.in_response_to_attribute(),
            audience = self.audience,
            attributes = attributes,
        )
    }

    /// The response around `assertion`, which may be signed or encrypted.
    pub fn render_with(&self, assertion: &str) -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}"{in_response_to}><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>{assertion}</samlp:Response>"#,
            samlp = PROTOCOL_NS,
            saml = ASSERTION_NS,
            id = self.response_id,
            instant = xml::format_instant(&self.issue_instant),
            destination = self.destination,
            in_response_to = self.in_response_to_attribute(),
            issuer = self.issuer,
            status = self.status_code,
            assertion = assertion,
        )
    }

    pub fn render(&self) -> String {
        if self.include_assertion {
            self.render_with(&self.render_assertion())
        } else {
            self.render_with("")
        }
    }

    /// Response signed by the IdP key over the whole message.
    pub fn render_signed(&self) -> String {
        sign_enveloped(
            &self.render(),
            &self.response_id,
            &idp_key().key,
            SignatureAlgorithm::RsaSha256,
        )
    }
}

const SIGNATURE_VALUE_PLACEHOLDER: &str = "<ds:SignatureValue></ds:SignatureValue>";

/// Add an enveloped signature to the element with `id`, placed right after
/// its `saml:Issuer`.
pub fn sign_enveloped(
    input: &str,
    id: &str,
    key: &PKey<Private>,
    alg: SignatureAlgorithm,
) -> String {
    let doc = xml::parse(input).unwrap();
    let target = xml::element_by_id(&doc, id)
        .unwrap()
        .expect("no element with that ID");
    let canonical =
        c14n::canonicalize(input, xml::element_ordinal(&doc, target).unwrap(), None, &[])
            .unwrap();
    let digest = base64::encode(hash(alg.digest(), canonical.as_bytes()).unwrap());

    let start = input.find(&format!("ID=\"{}\"", id)).unwrap();
    let issuer_end = start
        + input[start..].find("</saml:Issuer>").unwrap()
        + "</saml:Issuer>".len();
    let signature = format!(
        r##"<ds:Signature xmlns:ds="{ds}"><ds:SignedInfo><ds:CanonicalizationMethod Algorithm="{c14n}"/><ds:SignatureMethod Algorithm="{alg}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{c14n}"/></ds:Transforms><ds:DigestMethod Algorithm="{digest_alg}"/><ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>{placeholder}</ds:Signature>"##,
        ds = DSIG_NS,
        c14n = EXC_C14N,
        alg = alg.uri(),
        id = id,
        enveloped = ENVELOPED_SIGNATURE,
        digest_alg = alg.digest_uri(),
        digest = digest,
        placeholder = SIGNATURE_VALUE_PLACEHOLDER,
    );
    let unsigned = format!("{}{}{}", &input[..issuer_end], signature, &input[issuer_end..]);

    let doc = xml::parse(&unsigned).unwrap();
    let signed_info = doc
        .descendants()
        .find(|n| {
            xml::is(*n, DSIG_NS, "SignedInfo")
                && n.parent_element()
                    .and_then(|s| s.parent_element())
                    .and_then(|p| p.attribute("ID"))
                    == Some(id)
        })
        .unwrap();
    let canonical_signed_info = c14n::canonicalize(
        &unsigned,
        xml::element_ordinal(&doc, signed_info).unwrap(),
        None,
        &[],
    )
    .unwrap();
    let mut signer = Signer::new(alg.digest(), key).unwrap();
    signer.update(canonical_signed_info.as_bytes()).unwrap();
    let value = base64::encode(signer.sign_to_vec().unwrap());
    unsigned.replacen(
        SIGNATURE_VALUE_PLACEHOLDER,
        &format!("<ds:SignatureValue>{}</ds:SignatureValue>", value),
        1,
    )
}

#[derive(Clone, Copy, Debug)]
pub enum Encryption {
    Aes128CbcOaep,
    Aes256GcmRsa15,
}

/// Encrypt `plain` to `cert` as an `EncryptedAssertion`.
pub fn encrypt_element(plain: &str, cert: &X509, encryption: Encryption) -> String {
    let public = cert.public_key().unwrap();
    let (data_algorithm, key_algorithm, key_len) = match encryption {
        Encryption::Aes128CbcOaep => (
            "http://www.w3.org/2001/04/xmlenc#aes128-cbc",
            "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p",
            16,
        ),
        Encryption::Aes256GcmRsa15 => (
            "http://www.w3.org/2009/xmlenc11#aes256-gcm",
            "http://www.w3.org/2001/04/xmlenc#rsa-1_5",
            32,
        ),
    };
    let mut key = vec![0; key_len];
    rand_bytes(&mut key).unwrap();

    let data = match encryption {
        Encryption::Aes128CbcOaep => {
            let mut iv = [0u8; 16];
            rand_bytes(&mut iv).unwrap();
            let ciphertext =
                encrypt(Cipher::aes_128_cbc(), &key, Some(&iv), plain.as_bytes()).unwrap();
            [iv.to_vec(), ciphertext].concat()
        }
        Encryption::Aes256GcmRsa15 => {
            let mut iv = [0u8; 12];
            rand_bytes(&mut iv).unwrap();
            let mut tag = [0u8; 16];
            let ciphertext = encrypt_aead(
                Cipher::aes_256_gcm(),
                &key,
                Some(&iv),
                &[],
                plain.as_bytes(),
                &mut tag,
            )
            .unwrap();
            [iv.to_vec(), ciphertext, tag.to_vec()].concat()
        }
    };

    let mut encrypter = Encrypter::new(&public).unwrap();
    let digest_method = match encryption {
        Encryption::Aes128CbcOaep => {
            encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
            encrypter.set_rsa_oaep_md(MessageDigest::sha1()).unwrap();
            encrypter.set_rsa_mgf1_md(MessageDigest::sha1()).unwrap();
            "<ds:DigestMethod Algorithm=\"http://www.w3.org/2000/09/xmldsig#sha1\"/>".to_owned()
        }
        Encryption::Aes256GcmRsa15 => {
            encrypter.set_rsa_padding(Padding::PKCS1).unwrap();
            String::new()
        }
    };
    let mut wrapped = vec![0; encrypter.encrypt_len(&key).unwrap()];
    let len = encrypter.encrypt(&key, &mut wrapped).unwrap();
    wrapped.truncate(len);

    format!(
        r#"<saml:EncryptedAssertion xmlns:saml="{saml}"><xenc:EncryptedData xmlns:xenc="{xenc}" Type="http://www.w3.org/2001/04/xmlenc#Element"><xenc:EncryptionMethod Algorithm="{data_algorithm}"/><ds:KeyInfo xmlns:ds="{ds}"><xenc:EncryptedKey><xenc:EncryptionMethod Algorithm="{key_algorithm}">{digest_method}</xenc:EncryptionMethod><xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedKey></ds:KeyInfo><xenc:CipherData><xenc:CipherValue>{data}</xenc:CipherValue></xenc:CipherData></xenc:EncryptedData></saml:EncryptedAssertion>"#,
        saml = ASSERTION_NS,
        xenc = XENC_NS,
        ds = DSIG_NS,
        data_algorithm = data_algorithm,
        key_algorithm = key_algorithm,
        digest_method = digest_method,
        wrapped = base64::encode(wrapped),
        data = base64::encode(data),
    )
}

/// `application/x-www-form-urlencoded` body for the HTTP-POST binding.
pub fn post_body(parameter: &str, xml: &str, relay_state: Option<&str>) -> String {
    let mut body = form_urlencoded::Serializer::new(String::new());
    body.append_pair(parameter, &base64::encode(xml));
    if let Some(relay_state) = relay_state {
        body.append_pair("RelayState", relay_state);
    }
    body.finish()
}
