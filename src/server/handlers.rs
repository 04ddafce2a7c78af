//! Endpoint handlers
//!
//! Each handler adapts one request kind onto a build environment and is
//! responsible for status selection, for emitting `{message, log}` on
//! failures that carry a log, and for closing the environment on every
//! exit path. There are no retries at any layer.

use crate::buildenv::BuildEnv;
use crate::cache;
use crate::error::{SmithError, SmithResult};
use crate::exec::LogBuffer;
use crate::platform;
use crate::request::{BuildRequest, DeployRequest, Plugin};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::error;

use super::AppState;

/// Failure document returned alongside a 400/500 where a log exists
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub log: String,
}

/// Handler-level errors mapped onto HTTP statuses
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request; plain-text 400
    BadRequest(&'static str),
    /// A build or deploy step failed; 400 with `{message, log}`
    Failed(ErrorBody),
    /// The master cache may be inconsistent; 500 with `{message, log}`
    Integrity(ErrorBody),
    /// Our fault; 500 with no details leaked
    Internal(String),
}

impl ApiError {
    /// Classify an operation failure, attaching the environment log
    fn from_error(err: SmithError, log: &LogBuffer) -> Self {
        let body = ErrorBody {
            message: err.to_string(),
            log: log.contents(),
        };
        if err.is_integrity() {
            Self::Integrity(body)
        } else if err.is_client_error() {
            Self::Failed(body)
        } else {
            Self::Internal(err.to_string())
        }
    }

    fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::Failed(body) => {
                error!(message = %body.message, "request failed");
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Self::Integrity(body) => {
                error!(message = %body.message, "master cache may be inconsistent");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
            Self::Internal(msg) => {
                error!(message = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

/// `POST /build` — provision, build, sign, and stream the result as a
/// two-part multipart body: the detached signature, then the archive.
pub async fn build(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> Result<Response, ApiError> {
    if !req.platform.is_complete() {
        return Err(ApiError::BadRequest("missing required fields"));
    }

    // the build output lands here; the guard keeps the folder alive
    // until the response stream is done
    let out_dir = tempfile::Builder::new()
        .prefix("core_build_")
        .tempdir()
        .map_err(|e| ApiError::internal("creating build output folder", e))?;
    cache::chown_to_build_uid(out_dir.path(), &state.settings.sandbox)
        .map_err(|e| ApiError::internal("preparing build output folder", e))?;

    let log = LogBuffer::new();
    let env = BuildEnv::open(
        state.settings.clone(),
        &req.config.core_version,
        &req.config.plugins,
        log.clone(),
    )
    .await
    .map_err(|e| ApiError::from_error(e, &log))?;

    let built = match env.build(&req.platform, out_dir.path()).await {
        Ok(artifact) => artifact,
        Err(e) => {
            close_env(env);
            return Err(ApiError::from_error(e, &log));
        }
    };
    close_env(env);

    let signature = sign_artifact(&state, built.path.clone())
        .await
        .map_err(|e| ApiError::internal("signing archive", e))?;

    multipart_response(&built.name, signature, &built.path, out_dir)
        .await
        .map_err(|e| ApiError::internal("streaming archive", e))
}

/// `POST /deploy-core` — update the core in the master cache and verify
/// it across the full supported-platform list.
pub async fn deploy_core(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeployRequest>,
) -> Result<StatusCode, ApiError> {
    if req.core_version.is_empty() {
        return Err(ApiError::BadRequest("missing required field"));
    }
    deploy(state, &req.core_version, &[], &[]).await?;
    Ok(StatusCode::OK)
}

/// `POST /deploy-plugin` — update one plugin in the master cache and
/// verify it against the given core on the required platforms.
pub async fn deploy_plugin(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeployRequest>,
) -> Result<StatusCode, ApiError> {
    if req.core_version.is_empty() || req.plugin_package.is_empty() || req.plugin_version.is_empty()
    {
        return Err(ApiError::BadRequest("missing required field(s)"));
    }
    let plugin = Plugin {
        package: req.plugin_package.clone(),
        version: req.plugin_version.clone(),
        ..Plugin::default()
    };
    deploy(
        state,
        &req.core_version,
        std::slice::from_ref(&plugin),
        &req.required_platforms,
    )
    .await?;
    Ok(StatusCode::OK)
}

/// `GET /supported-platforms` — the current catalog as JSON
pub async fn supported_platforms(
    State(_state): State<Arc<AppState>>,
) -> Result<Json<Vec<platform::Platform>>, ApiError> {
    let platforms = platform::supported_platforms(&platform::unsupported_platforms())
        .await
        .map_err(|e| ApiError::internal("enumerating platforms", e))?;
    Ok(Json(platforms))
}

async fn deploy(
    state: Arc<AppState>,
    core_version: &str,
    plugins: &[Plugin],
    required_platforms: &[platform::Platform],
) -> Result<(), ApiError> {
    let log = LogBuffer::new();
    let env = BuildEnv::open(state.settings.clone(), core_version, plugins, log.clone())
        .await
        .map_err(|e| ApiError::from_error(e, &log))?;

    let result = env.deploy(required_platforms).await;
    close_env(env);
    result.map_err(|e| ApiError::from_error(e, &log))
}

/// Close a build environment, logging rather than masking a cleanup
/// failure (the operation's own result matters more)
fn close_env(env: BuildEnv) {
    if let Err(e) = env.close() {
        error!(error = %e, "closing build environment");
    }
}

async fn sign_artifact(state: &Arc<AppState>, path: std::path::PathBuf) -> SmithResult<Vec<u8>> {
    let state = state.clone();
    tokio::task::spawn_blocking(move || {
        let signer = state.signer.as_ref().ok_or(SmithError::NoSigningKey)?;
        let file = std::fs::File::open(&path)
            .map_err(|e| SmithError::io(format!("opening {}", path.display()), e))?;
        signer.sign_detached(file)
    })
    .await
    .map_err(|e| SmithError::Internal(format!("signing task failed: {e}")))?
}

/// Stream `signature` then the archive at `path` as multipart/form-data,
/// both parts named after the artifact. `out_dir` rides along inside the
/// stream so the file is not deleted out from under the client.
async fn multipart_response(
    name: &str,
    signature: Vec<u8>,
    path: &std::path::Path,
    out_dir: tempfile::TempDir,
) -> SmithResult<Response> {
    let boundary = format!("buildsmith{}", uuid::Uuid::new_v4().simple());

    let mut head = Vec::with_capacity(signature.len() + 512);
    write!(
        head,
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"signature\"; filename=\"{name}.asc\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .map_err(|e| SmithError::io("assembling multipart header", e))?;
    head.extend_from_slice(&signature);
    write!(
        head,
        "\r\n--{boundary}\r\n\
         Content-Disposition: form-data; name=\"archive\"; filename=\"{name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .map_err(|e| SmithError::io("assembling multipart header", e))?;
    let tail = Bytes::from(format!("\r\n--{boundary}--\r\n"));

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SmithError::io(format!("opening {}", path.display()), e))?;

    let stream = futures::stream::iter([Ok::<Bytes, std::io::Error>(Bytes::from(head))])
        .chain(ReaderStream::new(file))
        .chain(futures::stream::iter([Ok(tail)]))
        .inspect(move |_| {
            let _ = &out_dir;
        });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| SmithError::Internal(format!("building response: {e}")))
}
