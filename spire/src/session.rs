//! Local sessions created by federated logins.
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::{
    config::IdentityProviderConfig,
    error::Error,
    identity::Identity,
    message::{self, Assertion, NameId},
    store::{IdentityDirectory, SessionStore},
};

const SESSION_TOKEN_LEN: usize = 32;

pub(crate) fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// An authenticated session and what single logout needs to find it again.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSession {
    /// Session token, also the cookie value.
    pub id: String,
    pub tenant: String,
    pub identity_id: String,
    /// Configured `id` of the identity provider that authenticated it.
    pub idp_id: String,
    pub name_id: Option<NameId>,
    pub session_index: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Establish a session for `identity` from the assertion that authenticated
/// it.
///
/// Every call creates a fresh session with its own token, so concurrent
/// logins for one identity never share or overwrite state.
#[tracing::instrument(level = "info", skip(store, identity, assertion, idp), fields(identity = %identity.id, idp = %idp.id), err)]
pub async fn bind<S>(
    store: &S,
    identity: &Identity,
    assertion: &Assertion,
    idp: &IdentityProviderConfig,
) -> Result<LocalSession, Error>
where
    S: SessionStore + IdentityDirectory + Sync,
{
    if identity.suspended {
        return Err(Error::SuspendedUser(identity.id.clone()));
    }
    let now = message::now();
    let session = LocalSession {
        id: random_string(SESSION_TOKEN_LEN),
        tenant: identity.tenant.clone(),
        identity_id: identity.id.clone(),
        idp_id: idp.id.clone(),
        name_id: assertion.name_id.clone(),
        session_index: assertion.session_index().map(String::from),
        created_at: now,
    };
    // A failed login record must not leave a session behind.
    store.record_login(identity, now).await?;
    store.create_session(&session).await?;
    tracing::info!("Created session for identity {}", identity.id);
    Ok(session)
}
