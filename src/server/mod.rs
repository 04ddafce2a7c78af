//! HTTP request surface
//!
//! Three authenticated write endpoints (`/build`, `/deploy-core`,
//! `/deploy-plugin`) and one read endpoint (`/supported-platforms`),
//! each a thin adapter around a build environment. Request bodies and
//! query strings are capped; authentication is HTTP Basic with the
//! secret compared in constant time against a SHA-1 digest.

pub mod handlers;

use crate::config::{Credentials, Settings, MAX_BODY_BYTES, MAX_QUERY_STRING_LENGTH};
use crate::sign::Signer;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Shared state for all handlers
pub struct AppState {
    pub settings: Arc<Settings>,
    /// `None` when no signing key is configured; builds then fail rather
    /// than ship unsigned artifacts
    pub signer: Option<Signer>,
}

/// Build the service router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/build", post(handlers::build))
        .route("/deploy-core", post(handlers::deploy_core))
        .route("/deploy-plugin", post(handlers::deploy_plugin))
        .route("/supported-platforms", get(handlers::supported_platforms))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::from_fn(limit_query_string))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Reject oversized query strings before any handler work
async fn limit_query_string(req: Request, next: Next) -> Response {
    let len = req.uri().query().map_or(0, str::len);
    if len > MAX_QUERY_STRING_LENGTH {
        return (
            StatusCode::URI_TOO_LONG,
            "query string exceeded length limit",
        )
            .into_response();
    }
    next.run(req).await
}

/// HTTP Basic authentication for every endpoint
async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let supplied = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic);

    let (username, password) = supplied.unwrap_or_default();
    if !credentials_match(state.settings.credentials.as_ref(), &username, &password) {
        let shown: String = password.chars().take(5).collect();
        warn!(user = %username, pass_prefix = %shown, "wrong credentials");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(req).await
}

/// Decode a `Basic base64(user:pass)` header value
fn parse_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Compare supplied credentials against the configured ones. The secret
/// comparison is constant-time over SHA-1 digests; when no credentials
/// are configured the expected secret is the empty string (a startup
/// warning tells the operator).
fn credentials_match(configured: Option<&Credentials>, username: &str, password: &str) -> bool {
    let empty = Credentials {
        client_id: String::new(),
        key_digest: {
            let mut d = [0u8; 20];
            d.copy_from_slice(&Sha1::digest(b""));
            d
        },
    };
    let expected = configured.unwrap_or(&empty);

    if username != expected.client_id {
        return false;
    }
    let supplied: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    supplied.ct_eq(&expected.key_digest).into()
}
