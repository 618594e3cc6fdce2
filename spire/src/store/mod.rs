//! Storage module
//!
//! This module defines the traits for the state the service provider keeps
//! between requests: outstanding request IDs, sessions, the identity
//! directory and per-provider debug data. Based on the specified features a
//! store implementing them is exported.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use warp::Filter;

use crate::{
    identity::Identity,
    message::{Attributes, NameId},
    session::LocalSession,
};

/// Possible errors returned by the store. The important thing is that we're
/// differentiating between not found, a client error, and other failures, a
/// server error.
#[derive(Error, Debug)]
pub enum Error {
    /// Entity was not found.
    #[error("Could not find entity with ID {0}")]
    NotFound(String),
    /// Some other error prevented us from performing the action.
    #[error("Could not retrieve entity: {0}")]
    Failure(#[from] Box<dyn std::error::Error + Send + Sync>),
    /// A stored record could not be encoded or decoded.
    #[error("Could not encode entity: {0}")]
    Encoding(String),
}

/// Result of a store action.
pub type Result<T> = std::result::Result<T, Error>;

/// Correlation state for a request we sent and expect an answer to.
#[derive(Clone, Debug, PartialEq)]
pub struct OutstandingRequest {
    pub id: String,
    pub relay_state: Option<String>,
    /// Local session a LogoutRequest was sent on behalf of.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RequestStore {
    /// Remember an outbound request ID for `ttl`.
    async fn save_request_id(
        &self,
        id: &str,
        relay_state: Option<&str>,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()>;

    /// Take an outstanding request. A request can only be consumed once and
    /// an expired request is treated as unknown.
    async fn consume_request_id(&self, id: &str) -> Result<Option<OutstandingRequest>>;

    /// Record an assertion ID until `expires_at`. Returns `false` when the ID
    /// had already been recorded and is still live.
    async fn record_assertion_id(&self, id: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Drop request and assertion records that expired before `now`.
    /// Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait SessionStore {
    async fn create_session(&self, session: &LocalSession) -> Result<()>;

    async fn get_session(&self, token: &str) -> Result<Option<LocalSession>>;

    /// Remove a session. Removing an unknown session is not an error.
    async fn destroy_session(&self, token: &str) -> Result<()>;

    /// Sessions of `tenant` established by `idp_id` for exactly `name_id`.
    async fn sessions_for_name_id(
        &self,
        tenant: &str,
        idp_id: &str,
        name_id: &NameId,
    ) -> Result<Vec<LocalSession>>;

    /// Drop sessions created before `created_before`. Returns how many were
    /// removed.
    async fn purge_sessions(&self, created_before: DateTime<Utc>) -> Result<usize>;
}

/// The account directory the service provider logs people into.
#[async_trait]
pub trait IdentityDirectory {
    /// Find an identity, suspended or not.
    async fn find_identity(
        &self,
        tenant: &str,
        unique_id: &str,
        idp_id: &str,
    ) -> Result<Option<Identity>>;

    /// Create an identity for a first federated login.
    async fn provision_identity(
        &self,
        tenant: &str,
        unique_id: &str,
        idp_id: &str,
        attributes: &Attributes,
    ) -> Result<Identity>;

    /// Overwrite local attributes with values asserted by the IdP.
    async fn apply_federated_attributes(
        &self,
        identity: &Identity,
        updates: BTreeMap<String, String>,
    ) -> Result<Identity>;

    /// The "successful login" side effect.
    async fn record_login(&self, identity: &Identity, at: DateTime<Utc>) -> Result<()>;
}

/// Per identity provider scratch space for troubleshooting.
pub trait DebugLog {
    fn debug_set(&self, idp_id: &str, key: &str, value: &str) -> Result<()>;

    fn debug_get(&self, idp_id: &str, key: &str) -> Result<Option<String>>;
}

/// Everything the service provider needs from storage.
pub trait Store:
    RequestStore + SessionStore + IdentityDirectory + DebugLog + Clone + Send + Sync + 'static
{
}

impl<T> Store for T where
    T: RequestStore + SessionStore + IdentityDirectory + DebugLog + Clone + Send + Sync + 'static
{
}

#[cfg(not(feature = "data-in-memory"))]
compile_error!("A store implementation must be enabled, e.g. the data-in-memory feature");

#[cfg(feature = "data-in-memory")]
mod memory;

#[cfg(feature = "data-in-memory")]
pub use memory::Store as MemoryStore;

/// Remove everything that has expired, given how long sessions live.
#[tracing::instrument(level = "debug", skip(store), err)]
pub async fn purge_expired<S>(store: &S, session_lifetime: Duration) -> Result<usize>
where
    S: RequestStore + SessionStore + Sync,
{
    let now = Utc::now();
    let removed = store.purge_expired(now).await?
        + store.purge_sessions(now - session_lifetime).await?;
    if removed > 0 {
        tracing::info!("Purged {} expired records", removed);
    }
    Ok(removed)
}

/// Filter to inject the store into the request handler.
pub fn with_store<S: Store>(
    store: S,
) -> impl Filter<Extract = (S,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || store.clone())
}
