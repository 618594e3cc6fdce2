//! Federated login: sending the user to their identity provider and consuming
//! the response it posts back to the assertion consumer service.
use chrono::Utc;
use serde::Deserialize;
use url::form_urlencoded;
use warp::{
    http::{self, header, StatusCode},
    Rejection, Reply,
};

use crate::{
    codec::{decode_post, encode_redirect, PostForm},
    config::{ConfigStore, IdentityProviderConfig, Settings},
    debug,
    error::Error,
    identity,
    message::{self, AuthnRequest, Message, Response},
    session::{self, LocalSession},
    store::Store,
    validator::{self, Expectations},
};

/// Cookie holding the ID of the AuthnRequest the browser was sent off with.
pub const AUTHN_REQUEST_COOKIE: &str = "spire_authn_request";
pub const SESSION_COOKIE: &str = "spire_session";
/// One-shot message for the login page.
pub const FLASH_COOKIE: &str = "spire_flash";

pub(crate) type HttpResult = Result<http::Response<String>, http::Error>;

#[derive(Deserialize, Debug, Default)]
pub struct LoginParams {
    /// Ask the identity provider to authenticate again even when it has a
    /// session. Any value but `0` or `false` counts.
    pub force_login: Option<String>,
    /// Local path to land on after logging in.
    pub return_to: Option<String>,
}

impl LoginParams {
    fn force_login(&self) -> bool {
        !matches!(self.force_login.as_deref(), None | Some("0") | Some("false"))
    }
}

/// Whether `target` stays on this site.
pub(crate) fn is_local_path(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//") && !target.contains('\\')
}

pub(crate) fn redirect(location: &str) -> http::response::Builder {
    http::Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
}

pub(crate) fn cookie(name: &str, value: &str, path: &str, same_site: &str) -> String {
    format!(
        "{}={}; Path={}; HttpOnly; Secure; SameSite={}",
        name, value, path, same_site
    )
}

pub(crate) fn expired_cookie(name: &str, path: &str) -> String {
    format!("{}=; Path={}; Max-Age=0", name, path)
}

fn authn_request_cookie_path(tenant: &str) -> String {
    format!("/{}/login", tenant)
}

/// Reply for a failed request: policy failures go back to the login page with
/// a flash, everything else ends with its status and a generic message.
pub(crate) fn failure_reply(settings: &Settings, error: &Error) -> HttpResult {
    match error.status_code() {
        StatusCode::FOUND => {
            let flash: String = form_urlencoded::byte_serialize(error.user_message().as_bytes())
                .collect();
            redirect(&settings.config.login_path)
                .header(
                    header::SET_COOKIE,
                    cookie(FLASH_COOKIE, &flash, "/", "Lax"),
                )
                .body(String::new())
        }
        status => http::Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(error.user_message().to_owned()),
    }
}

/// An AuthnRequest on its way out.
#[derive(Debug)]
pub struct LoginRedirect {
    pub request_id: String,
    pub location: String,
}

fn select_idp<'a>(
    settings: &'a Settings,
    tenant: &str,
    idp_id: Option<&str>,
) -> Result<&'a IdentityProviderConfig, Error> {
    match idp_id {
        Some(idp_id) => settings.load_idp_config(tenant, idp_id),
        None => settings.default_idp(tenant),
    }
}

/// Build the AuthnRequest for `idp_id` (or the tenant's default provider) and
/// remember its ID until the response comes back.
#[tracing::instrument(level = "info", skip(store, settings, params), err)]
pub async fn begin_login<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    idp_id: Option<&str>,
    params: &LoginParams,
) -> Result<LoginRedirect, Error> {
    let idp = select_idp(settings, tenant, idp_id)?;
    let request = AuthnRequest {
        id: message::generate_id(),
        issue_instant: message::now(),
        destination: idp.sso_url.clone(),
        issuer: settings.sp_entity_id(tenant)?,
        assertion_consumer_service_url: settings.acs_url(tenant),
        force_authn: params.force_login(),
        name_id_format: idp.name_id_format.clone(),
        requested_authn_context: idp.requested_authn_context.clone(),
    };
    let relay_state = params.return_to.as_deref().filter(|r| is_local_path(r));
    store
        .save_request_id(&request.id, relay_state, None, settings.request_ttl())
        .await?;
    debug::sink_for(store, idp).set(debug::AUTHN_REQUEST_ID, &request.id);

    let location = encode_redirect(&request, relay_state, settings.redirect_signing(idp))?;
    tracing::info!("Sending AuthnRequest {} to {}", request.id, idp.id);
    Ok(LoginRedirect {
        request_id: request.id,
        location,
    })
}

/// A completed login.
#[derive(Debug)]
pub struct LoginSuccess {
    pub session: LocalSession,
    /// Where to send the browser next.
    pub redirect: String,
}

/// Consume a `SAMLResponse` posted by an identity provider.
///
/// `authn_request_id` is the outstanding request this browser started, if
/// any. Without one the response is treated as IdP initiated.
#[tracing::instrument(level = "info", skip(store, settings, form, authn_request_id), err)]
pub async fn consume_response<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    form: &PostForm,
    authn_request_id: Option<&str>,
) -> Result<LoginSuccess, Error> {
    let mut decoded = decode_post(form)?;
    if !matches!(decoded.message, Message::Response(_)) {
        return Err(Error::UnknownMessageType(decoded.message.kind().into()));
    }
    let idp = settings.idp_for_issuer(tenant, decoded.message.issuer())?;
    let sink = debug::sink_for(store, idp);
    sink.set(debug::RESPONSE, &decoded.xml);

    let certs = idp.certificates()?;
    if !certs.is_empty() {
        decoded.verify_signature(&certs)?;
    }
    decoded.decrypt(&settings.key, &certs)?;
    let response = match decoded.message {
        Message::Response(response) => response,
        other => return Err(Error::UnknownMessageType(other.kind().into())),
    };
    if let Some(in_response_to) = &response.in_response_to {
        sink.set(debug::IN_RESPONSE_TO, in_response_to);
    }

    let outcome = complete_login(
        store,
        settings,
        tenant,
        idp,
        &response,
        authn_request_id,
        decoded.relay_state.as_deref(),
        &*sink,
    )
    .await;
    match &outcome {
        Ok(login) => sink.set(
            debug::LOGIN_RESULT,
            &format!("logged in identity {}", login.session.identity_id),
        ),
        Err(e) => sink.set(debug::LOGIN_RESULT, &e.to_string()),
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn complete_login<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    idp: &IdentityProviderConfig,
    response: &Response,
    authn_request_id: Option<&str>,
    posted_relay_state: Option<&str>,
    sink: &dyn debug::DebugSink,
) -> Result<LoginSuccess, Error> {
    // The request this browser started must still be outstanding. Consuming
    // it makes a second response to the same request fail correlation.
    let outstanding = match authn_request_id {
        Some(id) => match store.consume_request_id(id).await? {
            Some(outstanding) => Some(outstanding),
            None => {
                return Err(Error::CorrelationMismatch {
                    expected: id.to_owned(),
                    actual: response.in_response_to.clone(),
                })
            }
        },
        None => None,
    };

    let now = Utc::now();
    let sp_entity_id = settings.sp_entity_id(tenant)?;
    let acs_url = settings.acs_url(tenant);
    let expectations = Expectations {
        sp_entity_id: &sp_entity_id,
        acs_url: &acs_url,
        expected_request_id: outstanding.as_ref().map(|o| o.id.as_str()),
        now,
        clock_skew: settings.clock_skew(),
    };
    let mut result = validator::validate(response, idp, &expectations);
    if settings.config.prevent_assertion_replay {
        validator::check_replay(store, response, now, &mut result).await?;
    }
    if !result.is_valid() {
        tracing::warn!("Response {} failed validation: {}", response.id, result);
        sink.set(debug::VALIDATION_ERRORS, &result.to_string());
    }
    result.into_result()?;

    let assertion = response
        .assertions
        .first()
        .ok_or_else(|| Error::ConditionsFailed("response carries no assertion".into()))?;
    let identity = identity::resolve(store, tenant, assertion, idp).await?;
    let session = session::bind(store, &identity, assertion, idp).await?;

    let redirect = outstanding
        .and_then(|o| o.relay_state)
        .or_else(|| posted_relay_state.map(String::from))
        .filter(|target| is_local_path(target))
        .unwrap_or_else(|| settings.config.default_redirect.clone());
    Ok(LoginSuccess { session, redirect })
}

/// Send the browser to its identity provider.
#[tracing::instrument(level = "info", skip(params, store, settings))]
pub async fn login_handler<S: Store>(
    tenant: String,
    idp_id: Option<String>,
    params: LoginParams,
    store: S,
    settings: Settings,
) -> Result<impl Reply, Rejection> {
    match begin_login(&store, &settings, &tenant, idp_id.as_deref(), &params).await {
        Ok(login) => Ok(redirect(&login.location)
            .header(
                header::SET_COOKIE,
                cookie(
                    AUTHN_REQUEST_COOKIE,
                    &login.request_id,
                    &authn_request_cookie_path(&tenant),
                    "None",
                ),
            )
            .body(String::new())),
        Err(e) => {
            tracing::error!("Failed to start login: {}", e);
            Ok(failure_reply(&settings, &e))
        }
    }
}

/// Assertion consumer service.
///
/// The identity provider posts its response here through the browser. A
/// successful login sets the session cookie and redirects onwards.
#[tracing::instrument(level = "info", skip(form, authn_request_id, store, settings))]
pub async fn consume_handler<S: Store>(
    tenant: String,
    form: PostForm,
    authn_request_id: Option<String>,
    store: S,
    settings: Settings,
) -> Result<impl Reply, Rejection> {
    let outcome = consume_response(
        &store,
        &settings,
        &tenant,
        &form,
        authn_request_id.as_deref(),
    )
    .await;
    match outcome {
        Ok(login) => Ok(redirect(&login.redirect)
            .header(
                header::SET_COOKIE,
                cookie(SESSION_COOKIE, &login.session.id, "/", "Lax"),
            )
            .header(
                header::SET_COOKIE,
                expired_cookie(AUTHN_REQUEST_COOKIE, &authn_request_cookie_path(&tenant)),
            )
            .body(String::new())),
        Err(e) => {
            tracing::error!("Login failed: {}", e);
            Ok(failure_reply(&settings, &e))
        }
    }
}
