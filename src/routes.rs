use std::{
    collections::HashSet,
    io::ErrorKind,
    net::SocketAddr,
    path::Path as FsPath,
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    artifacts::{ArtifactStore, StoreError},
    config::{Config, normalize_origin},
    download_spec::{DownloadRequest, MediaKind, Quality, build_download_spec},
    error::ApiError,
    job::Job,
    platform::Platform,
    probe::{InfoProbe, VideoInfo},
    rate_limit::{Endpoint, RateLimiter, resolve_identity},
    runner::{CommandRunner, JobOutcome, extract_printed_path},
};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub limiter: RateLimiter,
    pub runner: Arc<dyn CommandRunner>,
    pub probe: InfoProbe,
    pub download_timeout: Duration,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(store: ArtifactStore, runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            store: Arc::new(store),
            limiter: RateLimiter::in_memory(config.rate_limits.clone()),
            probe: InfoProbe::new(Arc::clone(&runner), config.info_timeout),
            runner,
            download_timeout: config.download_timeout,
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/get_info", post(get_info))
        .route("/download", post(download))
        .route("/download_file/{filename}", get(download_file))
        .route("/cleanup", post(cleanup))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Cross-origin access for the listed origins only. An empty list leaves the
/// API same-origin.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allowed_origins: Arc<HashSet<String>> = Arc::new(allowed_origins.iter().cloned().collect());
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION])
}

#[derive(Debug, Deserialize)]
struct InfoPayload {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadPayload {
    url: Option<String>,
    format: Option<serde_json::Value>,
    quality: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub filename: String,
    pub message: String,
    pub platform: Platform,
    pub quality: Quality,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub removed: usize,
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_info(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<InfoPayload>, JsonRejection>,
) -> Result<Json<VideoInfo>, ApiError> {
    admit(&state, &headers, addr, Endpoint::Info)?;
    let Json(payload) = payload.map_err(invalid_body)?;
    let url = validate_url(payload.url.as_deref())?;
    let platform = Platform::classify(&url);

    let info = state.probe.probe(&url, platform).await?;
    Ok(Json(info))
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<DownloadPayload>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    admit(&state, &headers, addr, Endpoint::Download)?;
    let Json(payload) = payload.map_err(invalid_body)?;

    let request = DownloadRequest {
        url: validate_url(payload.url.as_deref())?,
        media_kind: MediaKind::from_param(payload.format.as_ref().and_then(|value| value.as_str())),
        quality: Quality::from_param(payload.quality.as_ref().and_then(|value| value.as_str())),
    };
    let platform = Platform::classify(&request.url);

    let reservation = state.store.reserve(request.media_kind).await?;
    let spec = build_download_spec(&request, platform, &reservation.output_path);
    let mut job = Job::new(reservation.job_id.clone(), request, spec.output_path.clone());

    job.start().map_err(ApiError::internal)?;
    info!(
        "Descarga {} iniciada: platform={platform} kind={:?} quality={}",
        job.id(),
        job.request().media_kind,
        job.request().quality.as_str()
    );
    debug!("Descarga {} escribira en {:?}", job.id(), job.output_path());

    let outcome = state.runner.run(&spec.args, state.download_timeout).await;
    state.store.release(&reservation);
    let outcome = outcome?;
    job.finish(&outcome).map_err(ApiError::internal)?;

    match outcome {
        JobOutcome::Succeeded { stdout } => {
            let printed_path = extract_printed_path(&stdout);
            let artifact = state
                .store
                .locate_output(&reservation, printed_path.as_deref())
                .await
                .map_err(|error| match error {
                    StoreError::NotFound => {
                        warn!("Descarga {} termino sin archivo de salida", job.id());
                        ApiError::not_found("No se encontro el archivo descargado")
                    }
                    other => other.into(),
                })?;

            info!(
                "Descarga {} completada: {} ({} bytes)",
                job.id(),
                artifact.filename,
                artifact.size
            );
            Ok(Json(DownloadResponse {
                success: true,
                message: format!("Descarga completada: {}", artifact.filename),
                filename: artifact.filename,
                platform,
                quality: job.request().quality,
            }))
        }
        JobOutcome::Failed { .. } => {
            let stderr_excerpt = job.stderr_excerpt().unwrap_or_default();
            warn!(
                "Descarga {} fallo con codigo {:?}: {}",
                job.id(),
                job.exit_code(),
                stderr_excerpt
            );
            Err(ApiError::bad_request(format!(
                "Error en la descarga: {stderr_excerpt}"
            )))
        }
        JobOutcome::TimedOut { budget } => {
            warn!(
                "Descarga {} excedio {}s y fue cancelada",
                job.id(),
                budget.as_secs()
            );
            Err(ApiError::timeout(
                "Tiempo de espera agotado. El archivo puede ser muy grande.",
            ))
        }
    }
}

async fn download_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    admit(&state, &headers, addr, Endpoint::FileTransfer)?;
    let artifact = state.store.resolve(&filename).await?;

    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::not_found("Archivo no encontrado")
            } else {
                ApiError::internal(format!("No se pudo abrir el archivo: {error}"))
            }
        })?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&artifact.filename)),
    );
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(artifact.size));
    response_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&artifact.filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );

    Ok((response_headers, body).into_response())
}

async fn cleanup(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, ApiError> {
    admit(&state, &headers, addr, Endpoint::Cleanup)?;
    let removed = state.store.purge_all().await?;
    info!("Limpieza completada: {removed} entrada(s) eliminadas");

    Ok(Json(CleanupResponse {
        success: true,
        message: "Archivos eliminados".to_string(),
        removed,
    }))
}

fn admit(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
    endpoint: Endpoint,
) -> Result<(), ApiError> {
    let identity = resolve_identity(headers, addr, state.trust_proxy_headers);
    state.limiter.check(&identity, endpoint).map_err(|rejection| {
        warn!(
            "Limite {} excedido por {identity} en {endpoint:?}",
            rejection.rule.scope
        );
        ApiError::from(rejection)
    })
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    debug!("Cuerpo JSON rechazado: {rejection}");
    ApiError::bad_request("Solicitud invalida: se esperaba un cuerpo JSON con la URL")
}

fn validate_url(raw: Option<&str>) -> Result<String, ApiError> {
    let url = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL no proporcionada"))?;

    let parsed = Url::parse(url).map_err(|_| ApiError::bad_request("URL invalida"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("URL invalida"));
    }

    Ok(url.to_string())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
