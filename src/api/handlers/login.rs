//! `POST /api/v1/auth/login`.

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::{
        header::{InvalidHeaderValue, SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{Authenticator, LoginOutcome, LoginRequest, LoginStatus};
use crate::store::{NamespaceAccess, RepositoryAccess};

pub const SESSION_COOKIE_NAME: &str = "auth_session";

#[derive(Debug, Serialize, ToSchema)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub namespaces: Vec<NamespaceAccess>,
    pub repositories: Vec<RepositoryAccess>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub success: bool,
    pub status: LoginStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub authorized_scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl From<LoginOutcome> for LoginResponse {
    fn from(outcome: LoginOutcome) -> Self {
        let LoginOutcome {
            account,
            namespaces,
            repositories,
            result,
        } = outcome;
        let user = account.map(|account| UserProfile {
            user_id: account.id,
            username: account.username,
            role: result.role.clone(),
            namespaces,
            repositories,
        });
        Self {
            success: result.success,
            status: result.status,
            error_message: result.error_message,
            session_id: result.session_id,
            authorized_scopes: result.authorized_scopes,
            expires_at: result.expires_at,
            user,
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login succeeded, session cookie set", body = LoginResponse),
        (status = 400, description = "Malformed request body", body = String),
        (status = 403, description = "Unknown account, locked account, bad credentials or unauthorized scopes", body = LoginResponse),
        (status = 500, description = "Login could not be completed", body = LoginResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    authenticator: Extension<Arc<dyn Authenticator>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Invalid login request body: {rejection}");
            return (StatusCode::BAD_REQUEST, "Invalid request body".to_string()).into_response();
        }
    };

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let client_ip = extract_client_ip(&headers).unwrap_or_default();

    let outcome = authenticator
        .authenticate_user(&request, user_agent, &client_ip)
        .await;

    let status = status_code(outcome.result.status);
    let mut response_headers = HeaderMap::new();
    if outcome.result.success {
        match session_cookie(
            &outcome.result.session_id,
            authenticator.session_expiry_seconds(),
        ) {
            Ok(cookie) => {
                response_headers.insert(SET_COOKIE, cookie);
            }
            Err(err) => error!("Failed to build session cookie: {err}"),
        }
    }

    (status, response_headers, Json(LoginResponse::from(outcome))).into_response()
}

#[must_use]
pub fn status_code(status: LoginStatus) -> StatusCode {
    match status {
        LoginStatus::Ok => StatusCode::OK,
        LoginStatus::Forbidden => StatusCode::FORBIDDEN,
        LoginStatus::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `HttpOnly` cookie carrying the session id.
pub fn session_cookie(session_id: &str, max_age: i64) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE_NAME}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}"
    ))
}

/// First hop of `X-Forwarded-For`, falling back to `X-Real-IP`.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
