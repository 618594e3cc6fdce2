pub mod c14n;
pub mod codec;
pub mod config;
pub mod debug;
pub mod encryption;
pub mod error;
pub mod identity;
pub mod login;
pub mod logout;
pub mod message;
pub mod metadata;
pub mod session;
pub mod signature;
pub mod slo;
pub mod store;
pub mod templates;
pub mod validator;
pub mod x509;
pub mod xml;

#[cfg(test)]
pub(crate) mod testing;

use crate::{
    codec::PostForm,
    config::{with_settings, Settings},
    login::{consume_handler, login_handler, LoginParams, AUTHN_REQUEST_COOKIE, SESSION_COOKIE},
    logout::{logout_handler, slo_post_handler, slo_redirect_handler},
    metadata::metadata_handler,
    store::{with_store, Store},
};
use tracing_subscriber::fmt::format::FmtSpan;
use warp::{Filter, Rejection, Reply};

/// Largest form body accepted on the POST binding.
const MAX_FORM_SIZE: u64 = 1024 * 1024;

/// Return a warp app with everything wired up.
///
/// This will setup:
///     - Logging and tracing
///     - Store and settings injection
///     - Routing
#[tracing::instrument(level = "info", skip(store, settings))]
pub async fn app<S: Store>(
    store: S,
    settings: Settings,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "spire=info".to_owned());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    let metadata = warp::get().and(
        warp::path!(String / "saml2")
            .and(with_settings(settings.clone()))
            .and_then(metadata_handler)
            .with(warp::trace::named("metadata")),
    );

    // Routed ahead of login so "logout" is never taken for an IdP ID.
    let slo_redirect = warp::get().and(
        warp::path!(String / "login" / "saml" / "logout")
            .and(warp::query::raw())
            .and(warp::cookie::optional(SESSION_COOKIE))
            .and(with_store(store.clone()))
            .and(with_settings(settings.clone()))
            .and_then(slo_redirect_handler::<S>)
            .with(warp::trace::named("slo-redirect")),
    );

    let slo_post = warp::post().and(
        warp::path!(String / "login" / "saml" / "logout")
            .and(warp::body::content_length_limit(MAX_FORM_SIZE))
            .and(warp::body::form::<PostForm>())
            .and(warp::cookie::optional(SESSION_COOKIE))
            .and(with_store(store.clone()))
            .and(with_settings(settings.clone()))
            .and_then(slo_post_handler::<S>)
            .with(warp::trace::named("slo-post")),
    );

    let login = warp::get().and(
        warp::path!(String / "login" / "saml")
            .map(|tenant: String| (tenant, None::<String>))
            .untuple_one()
            .or(warp::path!(String / "login" / "saml" / String)
                .map(|tenant: String, idp_id: String| (tenant, Some(idp_id)))
                .untuple_one())
            .unify()
            .and(warp::query::<LoginParams>())
            .and(with_store(store.clone()))
            .and(with_settings(settings.clone()))
            .and_then(login_handler::<S>)
            .with(warp::trace::named("login")),
    );

    let consume = warp::post().and(
        warp::path!(String / "login" / "saml")
            .and(warp::body::content_length_limit(MAX_FORM_SIZE))
            .and(warp::body::form::<PostForm>())
            .and(warp::cookie::optional(AUTHN_REQUEST_COOKIE))
            .and(with_store(store.clone()))
            .and(with_settings(settings.clone()))
            .and_then(consume_handler::<S>)
            .with(warp::trace::named("consume")),
    );

    let logout = warp::get().and(
        warp::path!(String / "logout")
            .and(warp::cookie::optional(SESSION_COOKIE))
            .and(with_store(store))
            .and(with_settings(settings))
            .and_then(logout_handler::<S>)
            .with(warp::trace::named("logout")),
    );

    metadata
        .or(slo_redirect)
        .or(slo_post)
        .or(login)
        .or(consume)
        .or(logout)
        .with(warp::trace::request())
}
