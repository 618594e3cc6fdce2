//! Mapping asserted subjects onto local identities.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    config::{IdentityProviderConfig, IdentitySeed},
    error::Error,
    message::Assertion,
    store::IdentityDirectory,
};

/// Login attribute value meaning "use the subject's NameID".
pub const NAME_ID_ATTRIBUTE: &str = "NameID";

/// A local account bound to one identity provider.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub id: String,
    pub tenant: String,
    /// Value of the login attribute this identity is found by.
    pub unique_id: String,
    pub idp_id: String,
    pub suspended: bool,
    pub attributes: BTreeMap<String, String>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn new(tenant: &str, unique_id: &str, idp_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.into(),
            unique_id: unique_id.into(),
            idp_id: idp_id.into(),
            suspended: false,
            attributes: BTreeMap::new(),
            last_login_at: None,
        }
    }

    pub fn from_seed(tenant: &str, seed: &IdentitySeed) -> Self {
        Self {
            suspended: seed.suspended,
            attributes: seed.attributes.clone(),
            ..Self::new(tenant, &seed.unique_id, &seed.idp_id)
        }
    }
}

/// The value an assertion identifies its subject by, according to the
/// provider's login attribute.
pub fn unique_id(assertion: &Assertion, idp: &IdentityProviderConfig) -> Result<String, Error> {
    let value = if idp.login_attribute == NAME_ID_ATTRIBUTE {
        assertion
            .name_id
            .as_ref()
            .map(|name_id| name_id.value.clone())
            .filter(|value| !value.is_empty())
    } else {
        assertion
            .attributes
            .get(&idp.login_attribute)
            .and_then(|values| values.first())
            .cloned()
    };
    let value = value.ok_or_else(|| Error::MissingAttribute(idp.login_attribute.clone()))?;
    if idp.strip_domain_from_login_attribute {
        if let Some(at) = value.find('@') {
            return Ok(value[..at].to_owned());
        }
    }
    Ok(value)
}

/// Local attribute changes implied by the provider's federated attribute
/// mapping. Attributes the assertion does not carry are left alone.
fn federated_updates(
    identity: &Identity,
    assertion: &Assertion,
    idp: &IdentityProviderConfig,
) -> BTreeMap<String, String> {
    idp.federated_attributes
        .iter()
        .filter_map(|(provider_name, local_name)| {
            let value = assertion.attributes.get(provider_name)?.first()?;
            if identity.attributes.get(local_name) == Some(value) {
                None
            } else {
                Some((local_name.clone(), value.clone()))
            }
        })
        .collect()
}

/// Resolve the subject of `assertion` to a local identity, provisioning one
/// when the provider allows it.
///
/// Suspended identities are reported as [Error::UnknownUser]; the caller
/// shows the same message for every failure here.
#[tracing::instrument(level = "info", skip(directory, assertion, idp), fields(idp = %idp.id), err)]
pub async fn resolve<D>(
    directory: &D,
    tenant: &str,
    assertion: &Assertion,
    idp: &IdentityProviderConfig,
) -> Result<Identity, Error>
where
    D: IdentityDirectory + Sync,
{
    let unique_id = unique_id(assertion, idp)?;
    match directory.find_identity(tenant, &unique_id, &idp.id).await? {
        Some(identity) if identity.suspended => {
            tracing::warn!("Identity {} is suspended", identity.id);
            Err(Error::UnknownUser(unique_id))
        }
        Some(identity) => {
            let updates = federated_updates(&identity, assertion, idp);
            if updates.is_empty() {
                return Ok(identity);
            }
            match directory.apply_federated_attributes(&identity, updates).await {
                Ok(updated) => Ok(updated),
                Err(e) => {
                    tracing::warn!(
                        "Failed to apply federated attributes to {}: {}",
                        identity.id,
                        e
                    );
                    Ok(identity)
                }
            }
        }
        None if idp.jit_provisioning => {
            let identity = directory
                .provision_identity(tenant, &unique_id, &idp.id, &assertion.attributes)
                .await?;
            tracing::info!("Provisioned identity {}", identity.id);
            Ok(identity)
        }
        None => Err(Error::UnknownUser(unique_id)),
    }
}
