//! Logout routes.
use chrono::Utc;
use warp::{http::header, Rejection, Reply};

use crate::{
    codec::{decode_post, decode_redirect, Decoded, PostForm},
    config::{ConfigStore, Settings},
    error::Error,
    login::{expired_cookie, failure_reply, is_local_path, redirect, HttpResult, SESSION_COOKIE},
    session::LocalSession,
    slo::{self, SloOutcome},
    store::{SessionStore, Store},
};

/// The caller's session, provided it belongs to `tenant` and has not
/// outlived the session lifetime.
async fn current_session<S: SessionStore + Sync>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    token: Option<&str>,
) -> Result<Option<LocalSession>, Error> {
    let oldest = Utc::now() - settings.session_lifetime();
    match token {
        Some(token) => Ok(store
            .get_session(token)
            .await?
            .filter(|session| session.tenant == tenant && session.created_at >= oldest)),
        None => Ok(None),
    }
}

fn logout_reply(location: &str, session_destroyed: bool) -> HttpResult {
    let mut reply = redirect(location);
    if session_destroyed {
        reply = reply.header(header::SET_COOKIE, expired_cookie(SESSION_COOKIE, "/"));
    }
    reply.body(String::new())
}

async fn run_slo<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    decoded: Result<Decoded, Error>,
    session_token: Option<&str>,
) -> Result<SloOutcome, Error> {
    let decoded = decoded?;
    let session = current_session(store, settings, tenant, session_token).await?;
    slo::handle_logout(store, settings, tenant, decoded, session.as_ref()).await
}

fn slo_reply(settings: &Settings, outcome: Result<SloOutcome, Error>) -> HttpResult {
    match outcome {
        Ok(SloOutcome::Respond {
            location,
            session_destroyed,
        }) => logout_reply(&location, session_destroyed),
        Ok(SloOutcome::Finished {
            session_destroyed,
            relay_state,
        }) => {
            let location = relay_state
                .filter(|target| is_local_path(target))
                .unwrap_or_else(|| settings.config.login_path.clone());
            logout_reply(&location, session_destroyed)
        }
        Err(e) => {
            tracing::error!("Single logout failed: {}", e);
            failure_reply(settings, &e)
        }
    }
}

/// SLO endpoint, HTTP-Redirect binding.
#[tracing::instrument(level = "info", skip(query, session_token, store, settings))]
pub async fn slo_redirect_handler<S: Store>(
    tenant: String,
    query: String,
    session_token: Option<String>,
    store: S,
    settings: Settings,
) -> Result<impl Reply, Rejection> {
    let outcome = run_slo(
        &store,
        &settings,
        &tenant,
        decode_redirect(&query),
        session_token.as_deref(),
    )
    .await;
    Ok(slo_reply(&settings, outcome))
}

/// SLO endpoint, HTTP-POST binding.
#[tracing::instrument(level = "info", skip(form, session_token, store, settings))]
pub async fn slo_post_handler<S: Store>(
    tenant: String,
    form: PostForm,
    session_token: Option<String>,
    store: S,
    settings: Settings,
) -> Result<impl Reply, Rejection> {
    let outcome = run_slo(
        &store,
        &settings,
        &tenant,
        decode_post(&form),
        session_token.as_deref(),
    )
    .await;
    Ok(slo_reply(&settings, outcome))
}

/// Log the caller out, through their identity provider when it supports
/// single logout. Returns where to send the browser and whether the local
/// session is already gone.
#[tracing::instrument(level = "info", skip(store, settings, session_token), err)]
pub async fn logout<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    session_token: Option<&str>,
) -> Result<(String, bool), Error> {
    let session = match current_session(store, settings, tenant, session_token).await? {
        Some(session) => session,
        None => return Ok((settings.config.login_path.clone(), false)),
    };
    let federated = session.name_id.is_some()
        && settings
            .load_idp_config(tenant, &session.idp_id)
            .map(|idp| idp.slo_url.is_some())
            .unwrap_or(false);
    if federated {
        // The session ends when the identity provider answers.
        let location = slo::initiate_logout(store, settings, &session).await?;
        return Ok((location, false));
    }
    store.destroy_session(&session.id).await?;
    Ok((settings.config.login_path.clone(), true))
}

#[tracing::instrument(level = "info", skip(session_token, store, settings))]
pub async fn logout_handler<S: Store>(
    tenant: String,
    session_token: Option<String>,
    store: S,
    settings: Settings,
) -> Result<impl Reply, Rejection> {
    match logout(&store, &settings, &tenant, session_token.as_deref()).await {
        Ok((location, session_destroyed)) => Ok(logout_reply(&location, session_destroyed)),
        Err(e) => {
            tracing::error!("Logout failed: {}", e);
            Ok(failure_reply(&settings, &e))
        }
    }
}
