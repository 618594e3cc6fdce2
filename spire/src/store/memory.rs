use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use prost_sled::ProtoDb;

use super::{DebugLog, IdentityDirectory, OutstandingRequest, RequestStore, Result, SessionStore};
use crate::{identity::Identity, message::Attributes, message::NameId, session::LocalSession};

mod proto {
    include!(concat!(env!("OUT_DIR"), "/store.rs"));
}

impl From<prost_sled::Error> for super::Error {
    fn from(e: prost_sled::Error) -> Self {
        match e {
            prost_sled::Error::SledError(e) => super::Error::Failure(Box::new(e)),
            e => super::Error::Encoding(e.to_string()),
        }
    }
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp(seconds, 0)
}

impl From<NameId> for proto::NameId {
    fn from(name_id: NameId) -> Self {
        Self {
            value: name_id.value,
            format: name_id.format.unwrap_or_default(),
            name_qualifier: name_id.name_qualifier.unwrap_or_default(),
            sp_name_qualifier: name_id.sp_name_qualifier.unwrap_or_default(),
        }
    }
}

impl From<proto::NameId> for NameId {
    fn from(name_id: proto::NameId) -> Self {
        Self {
            value: name_id.value,
            format: optional(name_id.format),
            name_qualifier: optional(name_id.name_qualifier),
            sp_name_qualifier: optional(name_id.sp_name_qualifier),
        }
    }
}

impl From<&LocalSession> for proto::Session {
    fn from(session: &LocalSession) -> Self {
        Self {
            id: session.id.clone(),
            tenant: session.tenant.clone(),
            identity_id: session.identity_id.clone(),
            idp_id: session.idp_id.clone(),
            name_id: session.name_id.clone().map(Into::into),
            session_index: session.session_index.clone().unwrap_or_default(),
            created_at: session.created_at.timestamp(),
        }
    }
}

impl From<proto::Session> for LocalSession {
    fn from(session: proto::Session) -> Self {
        Self {
            id: session.id,
            tenant: session.tenant,
            identity_id: session.identity_id,
            idp_id: session.idp_id,
            name_id: session.name_id.map(Into::into),
            session_index: optional(session.session_index),
            created_at: timestamp(session.created_at),
        }
    }
}

impl From<&Identity> for proto::Identity {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            tenant: identity.tenant.clone(),
            unique_id: identity.unique_id.clone(),
            idp_id: identity.idp_id.clone(),
            suspended: identity.suspended,
            attributes: identity.attributes.clone().into_iter().collect(),
            last_login_at: identity.last_login_at.map(|t| t.timestamp()).unwrap_or(0),
        }
    }
}

impl From<proto::Identity> for Identity {
    fn from(identity: proto::Identity) -> Self {
        Self {
            id: identity.id,
            tenant: identity.tenant,
            unique_id: identity.unique_id,
            idp_id: identity.idp_id,
            suspended: identity.suspended,
            attributes: identity.attributes.into_iter().collect(),
            last_login_at: if identity.last_login_at == 0 {
                None
            } else {
                Some(timestamp(identity.last_login_at))
            },
        }
    }
}

const REQUEST_PREFIX: &str = "request/";
const SESSION_PREFIX: &str = "session/";
const ASSERTION_PREFIX: &str = "assertion/";

fn request_key(id: &str) -> String {
    format!("{}{}", REQUEST_PREFIX, id)
}

fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_PREFIX, token)
}

fn identity_key(tenant: &str, idp_id: &str, unique_id: &str) -> String {
    format!("identity/{}/{}/{}", tenant, idp_id, unique_id)
}

fn assertion_key(id: &str) -> String {
    format!("{}{}", ASSERTION_PREFIX, id)
}

fn debug_key(idp_id: &str, key: &str) -> String {
    format!("debug/{}/{}", idp_id, key)
}

/// Store backed by a sled database holding protobuf records.
#[derive(Clone, Debug)]
pub struct Store {
    db: ProtoDb,
}

impl Store {
    /// A store on a temporary database, gone when the process exits.
    pub fn new() -> Result<Self> {
        Ok(Self {
            db: ProtoDb::temporary()?,
        })
    }

    /// A store on the sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: ProtoDb::open(path)?,
        })
    }

    /// Add or replace an identity in the directory.
    pub fn insert_identity(&self, identity: &Identity) -> Result<()> {
        let _: Option<proto::Identity> = self.db.insert(
            identity_key(&identity.tenant, &identity.idp_id, &identity.unique_id),
            proto::Identity::from(identity),
        )?;
        Ok(())
    }

    fn update_identity<F>(&self, identity: &Identity, mut f: F) -> Result<Identity>
    where
        F: FnMut(&mut proto::Identity),
    {
        let key = identity_key(&identity.tenant, &identity.idp_id, &identity.unique_id);
        let updated: Option<proto::Identity> = self.db.update_and_fetch(&key, |existing| {
            let mut record = existing?;
            f(&mut record);
            Some(record)
        })?;
        updated
            .map(Into::into)
            .ok_or_else(|| super::Error::NotFound(identity.id.clone()))
    }
}

#[async_trait]
impl RequestStore for Store {
    async fn save_request_id(
        &self,
        id: &str,
        relay_state: Option<&str>,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let record = proto::OutstandingRequest {
            id: id.into(),
            relay_state: relay_state.unwrap_or_default().into(),
            session_id: session_id.unwrap_or_default().into(),
            created_at: now.timestamp(),
            expires_at: (now + ttl).timestamp(),
        };
        let _: Option<proto::OutstandingRequest> = self.db.insert(request_key(id), record)?;
        Ok(())
    }

    async fn consume_request_id(&self, id: &str) -> Result<Option<OutstandingRequest>> {
        let record: Option<proto::OutstandingRequest> = self.db.remove(request_key(id))?;
        let now = Utc::now().timestamp();
        Ok(record
            .filter(|record| record.expires_at > now)
            .map(|record| OutstandingRequest {
                id: record.id,
                relay_state: optional(record.relay_state),
                session_id: optional(record.session_id),
                created_at: timestamp(record.created_at),
                expires_at: timestamp(record.expires_at),
            }))
    }

    async fn record_assertion_id(&self, id: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let previous: Option<proto::SeenAssertion> = self.db.insert(
            assertion_key(id),
            proto::SeenAssertion {
                expires_at: expires_at.timestamp(),
            },
        )?;
        let now = Utc::now().timestamp();
        Ok(!previous.map_or(false, |seen| seen.expires_at > now))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = now.timestamp();
        let requests = self
            .db
            .retain_prefix(REQUEST_PREFIX, |record: &proto::OutstandingRequest| {
                record.expires_at > now
            })?;
        let assertions = self
            .db
            .retain_prefix(ASSERTION_PREFIX, |seen: &proto::SeenAssertion| {
                seen.expires_at > now
            })?;
        Ok(requests + assertions)
    }
}

#[async_trait]
impl SessionStore for Store {
    async fn create_session(&self, session: &LocalSession) -> Result<()> {
        let _: Option<proto::Session> = self
            .db
            .insert(session_key(&session.id), proto::Session::from(session))?;
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<LocalSession>> {
        let session: Option<proto::Session> = self.db.get(session_key(token))?;
        Ok(session.map(Into::into))
    }

    async fn destroy_session(&self, token: &str) -> Result<()> {
        let _: Option<proto::Session> = self.db.remove(session_key(token))?;
        Ok(())
    }

    async fn sessions_for_name_id(
        &self,
        tenant: &str,
        idp_id: &str,
        name_id: &NameId,
    ) -> Result<Vec<LocalSession>> {
        let sessions: Vec<proto::Session> = self.db.scan_prefix(SESSION_PREFIX)?;
        Ok(sessions
            .into_iter()
            .map(LocalSession::from)
            .filter(|session| {
                session.tenant == tenant
                    && session.idp_id == idp_id
                    && session
                        .name_id
                        .as_ref()
                        .map_or(false, |current| current.matches(name_id))
            })
            .collect())
    }

    async fn purge_sessions(&self, created_before: DateTime<Utc>) -> Result<usize> {
        let cutoff = created_before.timestamp();
        Ok(self
            .db
            .retain_prefix(SESSION_PREFIX, |session: &proto::Session| {
                session.created_at >= cutoff
            })?)
    }
}

#[async_trait]
impl IdentityDirectory for Store {
    async fn find_identity(
        &self,
        tenant: &str,
        unique_id: &str,
        idp_id: &str,
    ) -> Result<Option<Identity>> {
        let identity: Option<proto::Identity> =
            self.db.get(identity_key(tenant, idp_id, unique_id))?;
        Ok(identity.map(Into::into))
    }

    async fn provision_identity(
        &self,
        tenant: &str,
        unique_id: &str,
        idp_id: &str,
        attributes: &Attributes,
    ) -> Result<Identity> {
        let mut identity = Identity::new(tenant, unique_id, idp_id);
        identity.attributes = attributes
            .iter()
            .filter_map(|(name, values)| Some((name.clone(), values.first()?.clone())))
            .collect();
        let key = identity_key(tenant, idp_id, unique_id);
        // Two first logins racing each other end up with the same identity.
        let stored: Option<proto::Identity> = self.db.update_and_fetch(&key, |existing| {
            Some(existing.unwrap_or_else(|| proto::Identity::from(&identity)))
        })?;
        stored
            .map(Into::into)
            .ok_or_else(|| super::Error::NotFound(key))
    }

    async fn apply_federated_attributes(
        &self,
        identity: &Identity,
        updates: BTreeMap<String, String>,
    ) -> Result<Identity> {
        self.update_identity(identity, |record| {
            for (name, value) in &updates {
                record.attributes.insert(name.clone(), value.clone());
            }
        })
    }

    async fn record_login(&self, identity: &Identity, at: DateTime<Utc>) -> Result<()> {
        self.update_identity(identity, |record| record.last_login_at = at.timestamp())?;
        Ok(())
    }
}

impl DebugLog for Store {
    fn debug_set(&self, idp_id: &str, key: &str, value: &str) -> Result<()> {
        let _: Option<proto::DebugEntry> = self.db.insert(
            debug_key(idp_id, key),
            proto::DebugEntry {
                value: value.into(),
            },
        )?;
        Ok(())
    }

    fn debug_get(&self, idp_id: &str, key: &str) -> Result<Option<String>> {
        let entry: Option<proto::DebugEntry> = self.db.get(debug_key(idp_id, key))?;
        Ok(entry.map(|entry| entry.value))
    }
}
