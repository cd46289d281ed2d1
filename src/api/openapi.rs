use super::handlers::{health, login};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Routes registered here are both served and documented; `OPTIONS /health` is
/// added outside and stays undocumented.
pub(crate) fn api_router() -> OpenApiRouter {
    OpenApiRouter::with_openapi(base_document())
        .routes(routes!(health::health))
        .routes(routes!(login::login))
}

fn base_document() -> utoipa::openapi::OpenApi {
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and database status".to_string());
    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Password login and session issuance".to_string());

    OpenApiBuilder::new()
        .info(info)
        .tags(Some(vec![health_tag, auth_tag]))
        .build()
}
