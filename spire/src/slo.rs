//! Single logout, started by either side.
//!
//! Nothing here is a long lived state machine. A logout this service starts
//! is one LogoutRequest whose ID waits in the [RequestStore] for the
//! identity provider's LogoutResponse. A logout the identity provider starts
//! is answered straight away with a LogoutResponse, whatever the outcome.
use crate::{
    codec::{encode_redirect, Decoded},
    config::{ConfigStore, IdentityProviderConfig, Settings},
    debug,
    error::Error,
    identity::NAME_ID_ATTRIBUTE,
    message::{LogoutRequest, LogoutResponse, Message, Status},
    session::LocalSession,
    store::{RequestStore, SessionStore, Store},
};

const NO_CURRENT_SESSION: &str = "No current session";

/// Where a logout exchange leaves the browser.
#[derive(Clone, Debug, PartialEq)]
pub enum SloOutcome {
    /// Send the browser back to the identity provider with our answer.
    Respond {
        location: String,
        session_destroyed: bool,
    },
    /// The identity provider answered a logout we started.
    Finished {
        session_destroyed: bool,
        relay_state: Option<String>,
    },
}

fn slo_endpoint(idp: &IdentityProviderConfig) -> Result<&str, Error> {
    idp.slo_url.as_deref().ok_or_else(|| {
        Error::InvalidConfig(format!("identity provider {} has no SLO endpoint", idp.id))
    })
}

/// Start a logout at the identity provider that authenticated `session`.
///
/// Returns the URL to redirect the browser to.
#[tracing::instrument(level = "info", skip(store, settings, session), fields(idp = %session.idp_id), err)]
pub async fn initiate_logout<S>(
    store: &S,
    settings: &Settings,
    session: &LocalSession,
) -> Result<String, Error>
where
    S: RequestStore + Sync,
{
    let idp = settings.load_idp_config(&session.tenant, &session.idp_id)?;
    let name_id = session
        .name_id
        .clone()
        .ok_or_else(|| Error::MissingAttribute(NAME_ID_ATTRIBUTE.into()))?;
    let request = LogoutRequest::new(
        &settings.sp_entity_id(&session.tenant)?,
        slo_endpoint(idp)?,
        name_id,
        session.session_index.clone(),
    );
    // The answer may arrive without the session cookie, so the request
    // remembers which session it ends.
    store
        .save_request_id(
            &request.id,
            None,
            Some(&session.id),
            settings.request_ttl(),
        )
        .await?;
    tracing::info!("Sending LogoutRequest {} to {}", request.id, idp.id);
    encode_redirect(&request, None, settings.redirect_signing(idp))
}

/// Structural problems the SAML schema would reject.
fn schema_problems(message: &Message) -> Vec<&'static str> {
    let mut problems = Vec::new();
    let (id, version, issue_instant) = match message {
        Message::LogoutRequest(request) => {
            if request.name_id.is_none() && !request.encrypted_name_id {
                problems.push("LogoutRequest has no NameID");
            }
            (&request.id, &request.version, request.issue_instant.is_some())
        }
        Message::LogoutResponse(response) => {
            if response.status.code.is_empty() {
                problems.push("LogoutResponse has no StatusCode");
            }
            (&response.id, &response.version, response.issue_instant.is_some())
        }
        Message::Response(response) => (&response.id, &None, response.issue_instant.is_some()),
    };
    if id.is_empty() {
        problems.push("missing ID");
    }
    if version.as_deref() != Some("2.0") {
        problems.push("Version is not 2.0");
    }
    if !issue_instant {
        problems.push("missing IssueInstant");
    }
    problems
}

fn check_schema(message: &Message, idp: &IdentityProviderConfig) -> Result<(), Error> {
    let problems = schema_problems(message);
    if problems.is_empty() {
        return Ok(());
    }
    let problems = problems.join("; ");
    if idp.ignore_slo_schema_errors {
        tracing::warn!("Ignoring schema errors from {}: {}", idp.id, problems);
        Ok(())
    } else {
        Err(Error::MalformedMessage(problems))
    }
}

/// Handle a LogoutRequest or LogoutResponse arriving on the SLO endpoint.
///
/// `session` is the caller's current session, if any.
#[tracing::instrument(level = "info", skip(store, settings, decoded, session), fields(kind = decoded.message.kind()), err)]
pub async fn handle_logout<S: Store>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    mut decoded: Decoded,
    session: Option<&LocalSession>,
) -> Result<SloOutcome, Error> {
    let idp = settings.idp_for_issuer(tenant, decoded.message.issuer())?;
    let sink = debug::sink_for(store, idp);
    match &decoded.message {
        Message::LogoutRequest(_) => sink.set(debug::LOGOUT_REQUEST, &decoded.xml),
        Message::LogoutResponse(_) => sink.set(debug::LOGOUT_RESPONSE, &decoded.xml),
        Message::Response(_) => {
            return Err(Error::UnknownMessageType(decoded.message.kind().into()))
        }
    }

    check_schema(&decoded.message, idp)?;
    if idp.has_certificates() {
        decoded.verify_signature(&idp.certificates()?)?;
    }
    decoded.decrypt(&settings.key, &[])?;

    match decoded.message {
        Message::LogoutRequest(request) => {
            handle_logout_request(
                store,
                settings,
                tenant,
                &request,
                idp,
                session,
                decoded.relay_state.as_deref(),
            )
            .await
        }
        Message::LogoutResponse(response) => {
            handle_logout_response(store, &response, session, decoded.relay_state).await
        }
        Message::Response(response) => Err(Error::UnknownMessageType(format!(
            "Response {}",
            response.id
        ))),
    }
}

/// Finish a logout this service started.
///
/// The session ended is the one recorded with the outstanding request,
/// falling back to `session`. A response that does not answer an outstanding
/// request is a protocol error, but the local session is still ended so the
/// user is not stranded.
pub async fn handle_logout_response<S>(
    store: &S,
    response: &LogoutResponse,
    session: Option<&LocalSession>,
    relay_state: Option<String>,
) -> Result<SloOutcome, Error>
where
    S: RequestStore + SessionStore + Sync,
{
    let outstanding = match &response.in_response_to {
        Some(id) => {
            let outstanding = store.consume_request_id(id).await?;
            if outstanding.is_none() {
                tracing::warn!("LogoutResponse {} answers unknown request {}", response.id, id);
            }
            outstanding
        }
        None => {
            tracing::warn!("LogoutResponse {} has no InResponseTo", response.id);
            None
        }
    };

    if !response.status.is_success() {
        tracing::warn!(
            "Identity provider refused logout with status {}",
            response.status.code
        );
        return Ok(SloOutcome::Finished {
            session_destroyed: false,
            relay_state,
        });
    }

    let token = outstanding
        .and_then(|request| request.session_id)
        .or_else(|| session.map(|session| session.id.clone()));
    let session_destroyed = match token {
        Some(token) => {
            store.destroy_session(&token).await?;
            true
        }
        None => false,
    };
    Ok(SloOutcome::Finished {
        session_destroyed,
        relay_state,
    })
}

/// Answer a logout the identity provider started.
///
/// Once the message is authentic, a failed NameID check is reported in the
/// LogoutResponse status rather than as an error. Without a `session` the
/// sessions are found by NameID, narrowed to the SessionIndex values the
/// request names.
pub async fn handle_logout_request<S>(
    store: &S,
    settings: &Settings,
    tenant: &str,
    request: &LogoutRequest,
    idp: &IdentityProviderConfig,
    session: Option<&LocalSession>,
    relay_state: Option<&str>,
) -> Result<SloOutcome, Error>
where
    S: SessionStore + Sync,
{
    if idp.has_certificates() && !request.signed {
        return Err(Error::UnsignedMessage("LogoutRequest".into()));
    }
    // Nothing is destroyed unless the answer can be sent.
    let issuer = settings.sp_entity_id(tenant)?;
    let destination = slo_endpoint(idp)?;

    let sessions = match (session, &request.name_id) {
        (Some(session), _) => vec![session.clone()],
        (None, Some(name_id)) => store
            .sessions_for_name_id(tenant, &idp.id, name_id)
            .await?
            .into_iter()
            .filter(|candidate| {
                request.session_indexes.is_empty()
                    || candidate
                        .session_index
                        .as_ref()
                        .map_or(false, |index| request.session_indexes.contains(index))
            })
            .collect(),
        (None, None) => Vec::new(),
    };

    let status = match (sessions.as_slice(), &request.name_id) {
        ([], _) => Status::responder(NO_CURRENT_SESSION),
        (sessions, Some(name_id))
            if sessions.iter().all(|session| {
                session.idp_id == idp.id
                    && session
                        .name_id
                        .as_ref()
                        .map_or(false, |current| current.matches(name_id))
            }) =>
        {
            Status::success()
        }
        (_, _) => Status::responder(&Error::NameIdMismatch.to_string()),
    };

    let session_destroyed = if status.is_success() {
        for session in &sessions {
            store.destroy_session(&session.id).await?;
        }
        true
    } else {
        tracing::info!(
            "Refusing LogoutRequest {}: {}",
            request.id,
            status.message.as_deref().unwrap_or_default()
        );
        false
    };

    let response = LogoutResponse::new(&issuer, destination, &request.id, status);
    let location = encode_redirect(&response, relay_state, settings.redirect_signing(idp))?;
    Ok(SloOutcome::Respond {
        location,
        session_destroyed,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        codec::{decode_post, decode_redirect, PostForm},
        message::{NameId, STATUS_RESPONDER, STATUS_SUCCESS},
        signature::{verify_redirect_signature, SignatureAlgorithm},
        store::MemoryStore,
        testing,
    };
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn query(url: &str) -> &str {
        &url[url.find('?').unwrap() + 1..]
    }

    fn name_id() -> NameId {
        NameId {
            value: "alice@example.com".into(),
            format: Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".into()),
            name_qualifier: None,
            sp_name_qualifier: None,
        }
    }

    async fn session(store: &MemoryStore) -> LocalSession {
        let session = LocalSession {
            id: crate::session::random_string(32),
            tenant: testing::TENANT.into(),
            identity_id: "identity-1".into(),
            idp_id: testing::IDP_ID.into(),
            name_id: Some(name_id()),
            session_index: Some("session-1".into()),
            created_at: crate::message::now(),
        };
        store.create_session(&session).await.unwrap();
        session
    }

    /// A LogoutRequest from the identity provider on the redirect binding.
    fn idp_logout_request(name_id: NameId, signed: bool) -> (String, Decoded) {
        let request = LogoutRequest::new(
            testing::IDP_ENTITY_ID,
            "https://sp.example.com/acme/login/saml/logout",
            name_id,
            Some("session-1".into()),
        );
        let signing = if signed {
            Some((&testing::idp_key().key, SignatureAlgorithm::RsaSha256))
        } else {
            None
        };
        let url = encode_redirect(&request, Some("relay"), signing).unwrap();
        (request.id, decode_redirect(query(&url)).unwrap())
    }

    fn idp_logout_response(in_response_to: &str, status: Status) -> Decoded {
        let response = LogoutResponse::new(
            testing::IDP_ENTITY_ID,
            "https://sp.example.com/acme/login/saml/logout",
            in_response_to,
            status,
        );
        let url = encode_redirect(
            &response,
            None,
            Some((&testing::idp_key().key, SignatureAlgorithm::RsaSha256)),
        )
        .unwrap();
        decode_redirect(query(&url)).unwrap()
    }

    fn answer(location: &str) -> LogoutResponse {
        assert!(location.starts_with(testing::IDP_SLO_URL));
        let decoded = decode_redirect(query(location)).unwrap();
        verify_redirect_signature(
            decoded.redirect_signature.as_ref().unwrap(),
            &[testing::sp_key().cert.clone()],
        )
        .unwrap();
        match decoded.message {
            Message::LogoutResponse(response) => response,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initiate_logout() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;

        let url = initiate_logout(&store, &settings, &session).await.unwrap();
        assert!(url.starts_with(testing::IDP_SLO_URL));
        assert!(url.contains("&Signature="));
        let request = match decode_redirect(query(&url)).unwrap().message {
            Message::LogoutRequest(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.name_id, Some(name_id()));
        assert_eq!(request.session_indexes, vec!["session-1".to_owned()]);
        assert_eq!(request.issuer.as_deref(), Some(testing::SP_ENTITY_ID));
        assert!(store.consume_request_id(&request.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_initiate_logout_without_slo_endpoint() {
        let store = MemoryStore::new().unwrap();
        let mut config = testing::config();
        config.tenants[0].identity_providers[0].slo_url = None;
        let settings = Settings::new(config).unwrap();
        let session = session(&store).await;
        assert!(matches!(
            initiate_logout(&store, &settings, &session).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_logout_request_with_matching_name_id() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let (request_id, decoded) = idp_logout_request(name_id(), true);

        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session))
            .await
            .unwrap();
        let location = match outcome {
            SloOutcome::Respond {
                location,
                session_destroyed: true,
            } => location,
            other => panic!("unexpected {:?}", other),
        };
        let response = answer(&location);
        assert_eq!(response.status.code, STATUS_SUCCESS);
        assert_eq!(response.in_response_to.as_deref(), Some(request_id.as_str()));
        assert!(location.contains("RelayState=relay"));
        assert!(store.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_request_with_other_name_id() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let other = NameId {
            value: "bob@example.com".into(),
            ..name_id()
        };
        let (_, decoded) = idp_logout_request(other, true);

        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session))
            .await
            .unwrap();
        let location = match outcome {
            SloOutcome::Respond {
                location,
                session_destroyed: false,
            } => location,
            other => panic!("unexpected {:?}", other),
        };
        let response = answer(&location);
        assert_eq!(response.status.code, STATUS_RESPONDER);
        assert_eq!(
            response.status.message.as_deref(),
            Some("NameID does not match current session")
        );
        assert_eq!(
            store.get_session(&session.id).await.unwrap(),
            Some(session)
        );
    }

    #[tokio::test]
    async fn test_logout_request_without_session_is_answered() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let (_, decoded) = idp_logout_request(name_id(), true);

        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, None)
            .await
            .unwrap();
        match outcome {
            SloOutcome::Respond { location, .. } => {
                assert_eq!(answer(&location).status.code, STATUS_RESPONDER)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_request_without_cookie_matches_by_name_id() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let (_, decoded) = idp_logout_request(name_id(), true);

        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, None)
            .await
            .unwrap();
        let location = match outcome {
            SloOutcome::Respond {
                location,
                session_destroyed: true,
            } => location,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(answer(&location).status.code, STATUS_SUCCESS);
        assert!(store.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_request_for_other_session_index_is_refused() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let request = LogoutRequest::new(
            testing::IDP_ENTITY_ID,
            "https://sp.example.com/acme/login/saml/logout",
            name_id(),
            Some("session-2".into()),
        );
        let url = encode_redirect(
            &request,
            None,
            Some((&testing::idp_key().key, SignatureAlgorithm::RsaSha256)),
        )
        .unwrap();
        let decoded = decode_redirect(query(&url)).unwrap();

        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, None)
            .await
            .unwrap();
        match outcome {
            SloOutcome::Respond { location, .. } => {
                assert_eq!(answer(&location).status.code, STATUS_RESPONDER)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logout_request_without_slo_endpoint_keeps_session() {
        let store = MemoryStore::new().unwrap();
        let mut config = testing::config();
        config.tenants[0].identity_providers[0].slo_url = None;
        let settings = Settings::new(config).unwrap();
        let session = session(&store).await;
        let (_, decoded) = idp_logout_request(name_id(), true);

        assert!(matches!(
            handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session)).await,
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(
            store.get_session(&session.id).await.unwrap(),
            Some(session)
        );
    }

    #[tokio::test]
    async fn test_unsigned_logout_request_is_rejected() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let (_, decoded) = idp_logout_request(name_id(), false);

        assert!(matches!(
            handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session)).await,
            Err(Error::UnsignedMessage(_))
        ));
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logout_request_signed_by_stranger_is_rejected() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let request = LogoutRequest::new(
            testing::IDP_ENTITY_ID,
            "https://sp.example.com/acme/login/saml/logout",
            name_id(),
            None,
        );
        let url = encode_redirect(
            &request,
            None,
            Some((&testing::other_key().key, SignatureAlgorithm::RsaSha256)),
        )
        .unwrap();
        let decoded = decode_redirect(query(&url)).unwrap();

        assert!(matches!(
            handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session)).await,
            Err(Error::InvalidSignature(_))
        ));
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logout_response_ends_session() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let url = initiate_logout(&store, &settings, &session).await.unwrap();
        let request_id = decode_redirect(query(&url)).unwrap().message.id().to_owned();

        let decoded = idp_logout_response(&request_id, Status::success());
        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SloOutcome::Finished {
                session_destroyed: true,
                relay_state: None
            }
        );
        assert!(store.get_session(&session.id).await.unwrap().is_none());
        assert!(store.consume_request_id(&request_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_response_without_cookie_ends_session() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;
        let url = initiate_logout(&store, &settings, &session).await.unwrap();
        let request_id = decode_redirect(query(&url)).unwrap().message.id().to_owned();

        // Cross-site POSTs arrive without the Lax session cookie.
        let decoded = idp_logout_response(&request_id, Status::success());
        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SloOutcome::Finished {
                session_destroyed: true,
                relay_state: None
            }
        );
        assert!(store.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncorrelated_logout_response_still_ends_session() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;

        let decoded = idp_logout_response("_never-sent", Status::success());
        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SloOutcome::Finished {
                session_destroyed: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_logout_response_keeps_session() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let session = session(&store).await;

        let decoded = idp_logout_response("_q", Status::responder("no"));
        let outcome = handle_logout(&store, &settings, testing::TENANT, decoded, Some(&session))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SloOutcome::Finished {
                session_destroyed: false,
                ..
            }
        ));
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    fn post(xml: &str) -> Decoded {
        decode_post(&PostForm {
            saml_request: Some(base64::encode(xml)),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_schema_errors() {
        let store = MemoryStore::new().unwrap();
        let xml = format!(
            r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_lr" IssueInstant="{}"><saml:Issuer>{}</saml:Issuer><saml:NameID>nobody</saml:NameID></samlp:LogoutRequest>"#,
            crate::xml::format_instant(&Utc::now()),
            testing::IDP_ENTITY_ID
        );

        let settings = testing::settings();
        assert!(matches!(
            handle_logout(&store, &settings, testing::TENANT, post(&xml), None).await,
            Err(Error::MalformedMessage(_))
        ));

        let mut config = testing::config();
        let idp = &mut config.tenants[0].identity_providers[0];
        idp.ignore_slo_schema_errors = true;
        idp.certificates.clear();
        let settings = Settings::new(config).unwrap();
        let outcome = handle_logout(&store, &settings, testing::TENANT, post(&xml), None)
            .await
            .unwrap();
        assert!(matches!(outcome, SloOutcome::Respond { .. }));
    }

    #[tokio::test]
    async fn test_login_response_on_logout_endpoint() {
        let store = MemoryStore::new().unwrap();
        let settings = testing::settings();
        let fixture = testing::ResponseFixture::new();
        let decoded = decode_post(&PostForm {
            saml_response: Some(base64::encode(fixture.render())),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            handle_logout(&store, &settings, testing::TENANT, decoded, None).await,
            Err(Error::UnknownMessageType(_))
        ));
    }
}
