//! Per identity provider troubleshooting data.
//!
//! When a provider has `debugging` switched on, the raw messages exchanged
//! with it are kept under well known keys so an administrator can inspect
//! the last attempt. Nothing reads them back on the request path.
use crate::{config::IdentityProviderConfig, store::DebugLog};

pub const AUTHN_REQUEST_ID: &str = "authn_request_id";
pub const RESPONSE: &str = "response";
pub const IN_RESPONSE_TO: &str = "in_response_to";
pub const VALIDATION_ERRORS: &str = "validation_errors";
pub const LOGIN_RESULT: &str = "login_result";
pub const LOGOUT_REQUEST: &str = "logout_request";
pub const LOGOUT_RESPONSE: &str = "logout_response";

pub trait DebugSink: Send + Sync {
    fn set(&self, key: &str, value: &str);
}

/// Sink used when debugging is off.
pub struct NoopDebugSink;

impl DebugSink for NoopDebugSink {
    fn set(&self, _key: &str, _value: &str) {}
}

/// Sink writing into the store's [DebugLog] under the provider's ID.
pub struct ProviderDebugSink<'a, L> {
    log: &'a L,
    idp_id: String,
}

impl<'a, L: DebugLog + Send + Sync> DebugSink for ProviderDebugSink<'a, L> {
    fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.log.debug_set(&self.idp_id, key, value) {
            tracing::warn!("Failed to record debug data {}: {}", key, e);
        }
    }
}

/// The sink for `idp`, persisting only when its debugging flag is set.
pub fn sink_for<'a, L: DebugLog + Send + Sync>(
    log: &'a L,
    idp: &IdentityProviderConfig,
) -> Box<dyn DebugSink + 'a> {
    if idp.debugging {
        Box::new(ProviderDebugSink {
            log,
            idp_id: idp.id.clone(),
        })
    } else {
        Box::new(NoopDebugSink)
    }
}
