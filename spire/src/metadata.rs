use warp::{http::Response, Rejection, Reply};

use crate::{
    config::Settings,
    error::Error,
    message::NAME_ID_FORMAT_UNSPECIFIED,
    templates::{Metadata, Template},
    x509, xml,
};

/// Render the service provider metadata of `tenant`.
///
/// Only formats that some identity provider is configured to request are
/// advertised, `unspecified` otherwise.
pub fn render_metadata(settings: &Settings, tenant: &str) -> Result<String, Error> {
    let tenant_config = settings.tenant(tenant)?;
    let mut name_id_formats: Vec<&str> = tenant_config
        .identity_providers
        .iter()
        .filter_map(|idp| idp.name_id_format.as_deref())
        .collect();
    name_id_formats.sort_unstable();
    name_id_formats.dedup();
    if name_id_formats.is_empty() {
        name_id_formats.push(NAME_ID_FORMAT_UNSPECIFIED);
    }

    let entity_id = settings.sp_entity_id(tenant)?;
    let metadata = Metadata {
        entity_id: &entity_id,
        valid_until: xml::format_instant(&x509::not_after(&settings.certificate)?),
        certificate: x509::certificate_base64(&settings.certificate)?,
        authn_requests_signed: tenant_config
            .identity_providers
            .iter()
            .any(|idp| idp.signature_algorithm.is_some()),
        name_id_formats,
        acs_url: settings.acs_url(tenant),
        slo_url: settings.slo_url(tenant),
    };
    Ok(metadata.render()?)
}

#[tracing::instrument(level = "info", skip(settings))]
pub async fn metadata_handler(tenant: String, settings: Settings) -> Result<impl Reply, Rejection> {
    match render_metadata(&settings, &tenant) {
        Ok(metadata) => Ok(Response::builder()
            .header(warp::http::header::CONTENT_TYPE, "application/samlmetadata+xml")
            .body(metadata)),
        Err(e) => {
            tracing::error!("Failed to render metadata for {}: {}", tenant, e);
            Ok(Response::builder()
                .status(e.status_code())
                .body(e.user_message().to_owned()))
        }
    }
}
