//! Service provider configuration.
//!
//! Everything is read from a JSON document at start-up and is read-only
//! while requests are processed.
use std::{collections::BTreeMap, path::Path, sync::Arc};

use chrono::Duration;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use serde::Deserialize;
use warp::Filter;

use crate::{error::Error, signature::SignatureAlgorithm, x509};

fn default_request_ttl() -> i64 {
    300
}

fn default_clock_skew() -> i64 {
    180
}

fn default_session_lifetime() -> i64 {
    8 * 60 * 60
}

fn default_login_path() -> String {
    "/login".into()
}

fn default_redirect() -> String {
    "/".into()
}

fn default_login_attribute() -> String {
    "NameID".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// External base URL of this service, e.g. `https://sp.example.com`.
    pub base_url: String,
    /// PEM private key used to sign requests and decrypt assertions.
    #[serde(default)]
    pub private_key: Option<String>,
    /// PEM certificate matching `private_key`.
    #[serde(default)]
    pub certificate: Option<String>,
    /// How long an AuthnRequest or LogoutRequest waits for its answer.
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: i64,
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
    /// Local sessions older than this are treated as logged out.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_secs: i64,
    /// Reject a second use of an assertion ID within its validity window.
    #[serde(default)]
    pub prevent_assertion_replay: bool,
    /// Where failed logins land.
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Where successful logins land when there is no usable relay state.
    #[serde(default = "default_redirect")]
    pub default_redirect: String,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    /// Defaults to `{base_url}/{id}/saml2`, the metadata URL.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub identity_providers: Vec<IdentityProviderConfig>,
    /// Identities loaded into the directory at start-up.
    #[serde(default)]
    pub identities: Vec<IdentitySeed>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentitySeed {
    pub unique_id: String,
    pub idp_id: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityProviderConfig {
    pub id: String,
    pub entity_id: String,
    pub sso_url: String,
    #[serde(default)]
    pub slo_url: Option<String>,
    /// PEM or bare base64 DER. Any one of them may sign.
    #[serde(default)]
    pub certificates: Vec<String>,
    /// Sign outbound redirects with this algorithm. Unsigned when absent.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// `NameID` or the name of the attribute identifying the user.
    #[serde(default = "default_login_attribute")]
    pub login_attribute: String,
    #[serde(default)]
    pub name_id_format: Option<String>,
    #[serde(default)]
    pub requested_authn_context: Option<String>,
    /// IdP attribute name to local attribute name, copied on every login.
    #[serde(default)]
    pub federated_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_audience_condition: bool,
    #[serde(default)]
    pub ignore_slo_schema_errors: bool,
    #[serde(default)]
    pub jit_provisioning: bool,
    #[serde(default)]
    pub strip_domain_from_login_attribute: bool,
    #[serde(default)]
    pub debugging: bool,
}

impl IdentityProviderConfig {
    /// Parsed signing certificates.
    pub fn certificates(&self) -> Result<Vec<X509>, Error> {
        self.certificates
            .iter()
            .map(|cert| x509::parse_certificate(cert))
            .collect()
    }

    pub fn has_certificates(&self) -> bool {
        !self.certificates.is_empty()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidConfig(format!("reading {}: {}", path.as_ref().display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

/// Lookup of identity provider configuration.
pub trait ConfigStore {
    /// Find an identity provider by its configured `id` or its entity ID.
    fn load_idp_config(
        &self,
        tenant: &str,
        entity_id_or_id: &str,
    ) -> Result<&IdentityProviderConfig, Error>;

    /// Find the identity provider that issued a message. Messages without an
    /// issuer are attributed to the tenant's only provider, if it has one.
    fn idp_for_issuer(
        &self,
        tenant: &str,
        issuer: Option<&str>,
    ) -> Result<&IdentityProviderConfig, Error>;
}

/// Configuration plus the service provider's key material.
#[derive(Clone, Debug)]
pub struct Settings {
    pub config: Arc<Config>,
    pub key: PKey<Private>,
    pub certificate: X509,
}

impl Settings {
    /// Build settings from `config`, generating a key pair when none is
    /// configured.
    #[tracing::instrument(level = "info", skip(config))]
    pub fn new(config: Config) -> Result<Self, Error> {
        let (key, certificate) = match (&config.private_key, &config.certificate) {
            (Some(key), Some(cert)) => (x509::parse_private_key(key)?, x509::parse_certificate(cert)?),
            (None, None) => {
                let host = url::Url::parse(&config.base_url)
                    .ok()
                    .and_then(|url| url.host_str().map(String::from))
                    .unwrap_or_else(|| "spire".into());
                let (cert, key, expiry) = x509::generate_cert(&host, 2048)?;
                tracing::info!("Generated service provider key pair valid until {}", expiry);
                (key, cert)
            }
            _ => {
                return Err(Error::InvalidConfig(
                    "private_key and certificate must be configured together".into(),
                ))
            }
        };
        let pubkey = certificate.public_key()?;
        if !pubkey.public_eq(&key) {
            return Err(Error::InvalidConfig(
                "certificate does not match private key".into(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            key,
            certificate,
        })
    }

    pub fn tenant(&self, tenant: &str) -> Result<&TenantConfig, Error> {
        self.config
            .tenants
            .iter()
            .find(|t| t.id == tenant)
            .ok_or_else(|| Error::NoMatchingProvider(format!("tenant {}", tenant)))
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    pub fn sp_entity_id(&self, tenant: &str) -> Result<String, Error> {
        Ok(self
            .tenant(tenant)?
            .entity_id
            .clone()
            .unwrap_or_else(|| self.metadata_url(tenant)))
    }

    pub fn metadata_url(&self, tenant: &str) -> String {
        format!("{}/{}/saml2", self.base_url(), tenant)
    }

    pub fn acs_url(&self, tenant: &str) -> String {
        format!("{}/{}/login/saml", self.base_url(), tenant)
    }

    pub fn slo_url(&self, tenant: &str) -> String {
        format!("{}/{}/login/saml/logout", self.base_url(), tenant)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(self.config.clock_skew_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::seconds(self.config.request_ttl_secs)
    }

    pub fn session_lifetime(&self) -> Duration {
        Duration::seconds(self.config.session_lifetime_secs)
    }

    /// Key and algorithm for signing redirects to `idp`. Redirects go out
    /// unsigned when the provider has no algorithm configured.
    pub fn redirect_signing(
        &self,
        idp: &IdentityProviderConfig,
    ) -> Option<(&PKey<Private>, SignatureAlgorithm)> {
        idp.signature_algorithm.map(|alg| (&self.key, alg))
    }

    /// The identity provider used when a login does not name one.
    pub fn default_idp(&self, tenant: &str) -> Result<&IdentityProviderConfig, Error> {
        self.tenant(tenant)?
            .identity_providers
            .first()
            .ok_or_else(|| Error::NoMatchingProvider(format!("no provider for {}", tenant)))
    }
}

impl ConfigStore for Settings {
    fn load_idp_config(
        &self,
        tenant: &str,
        entity_id_or_id: &str,
    ) -> Result<&IdentityProviderConfig, Error> {
        self.tenant(tenant)?
            .identity_providers
            .iter()
            .find(|idp| idp.id == entity_id_or_id || idp.entity_id == entity_id_or_id)
            .ok_or_else(|| Error::NoMatchingProvider(entity_id_or_id.into()))
    }

    fn idp_for_issuer(
        &self,
        tenant: &str,
        issuer: Option<&str>,
    ) -> Result<&IdentityProviderConfig, Error> {
        let providers = &self.tenant(tenant)?.identity_providers;
        match issuer {
            Some(issuer) => providers
                .iter()
                .find(|idp| idp.entity_id == issuer)
                .ok_or_else(|| Error::NoMatchingProvider(issuer.into())),
            None if providers.len() == 1 => Ok(&providers[0]),
            None => Err(Error::NoMatchingProvider("message without issuer".into())),
        }
    }
}

/// Filter to inject the settings into the request handler.
pub fn with_settings(
    settings: Settings,
) -> impl Filter<Extract = (Settings,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || settings.clone())
}
