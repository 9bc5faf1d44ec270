use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Form, FromRequest, Query, Request, State, rejection::QueryRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    admission::{Admission, AdmissionController},
    config::non_empty,
    error::ApiError,
    proxy::{DownloadProxy, ProxyError},
    resolver::{LinkResolver, ResolveError},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const NO_VIDEO_FOUND: &str = "No video found";
const GENERIC_RESOLVE_FAILURE: &str = "Failed to process the request";

/// Hardening headers added to every response that does not set its own.
const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "SAMEORIGIN"),
    ("referrer-policy", "no-referrer"),
    ("cross-origin-opener-policy", "same-origin"),
    ("x-permitted-cross-domain-policies", "none"),
];

#[derive(Clone)]
pub struct AppState {
    pub resolver: LinkResolver,
    pub proxy: DownloadProxy,
    pub admission: Arc<AdmissionController>,
    pub expose_error_details: bool,
    pub trust_proxy_headers: bool,
}

/// Body of a resolve request, accepted as JSON or as an urlencoded form.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
}

impl<S> FromRequest<S> for DownloadRequest
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(body) = Form::<Self>::from_request(request, state)
                .await
                .map_err(|rejection| invalid_body(rejection.body_text()))?;
            return Ok(body);
        }

        let body = Bytes::from_request(request, state)
            .await
            .map_err(|rejection| invalid_body(rejection.body_text()))?;

        // An empty body is a request without a url, not a malformed one.
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let Json(body) =
            Json::<Self>::from_bytes(&body).map_err(|rejection| invalid_body(rejection.body_text()))?;
        Ok(body)
    }
}

fn invalid_body(detail: String) -> ApiError {
    debug!(%detail, "rejected resolve body");
    ApiError::bad_request(format!("Invalid request body: {detail}"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMedia {
    pub direct_url: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    #[serde(default, rename = "mediaUrl", alias = "videoUrl")]
    pub media_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LandingQuery {
    error: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let pages = Router::new()
        .route("/", get(landing_page))
        .route("/api/health", get(health))
        .route("/resolve", post(resolve_link))
        .route("/download", get(redirect_home).post(resolve_link))
        .layer(CompressionLayer::new());

    // Media is already compressed and relayed as-is.
    let media = Router::new()
        .route("/stream", get(stream_media))
        .route("/download-video", get(stream_media));

    let app = pages
        .merge(media)
        .layer(middleware::from_fn_with_state(state.clone(), admit_request));

    SECURITY_HEADERS
        .into_iter()
        .fold(app, |app, (name, value)| {
            app.layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            ))
        })
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-version"),
            HeaderValue::from_static(VERSION),
        ))
        .with_state(state)
}

async fn admit_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = client_identity(&state, &request);

    match state.admission.admit(&identity) {
        Admission::Allowed { remaining } => {
            debug!(%identity, remaining, "request admitted");
            next.run(request).await
        }
        Admission::Denied { retry_after } => {
            warn!(%identity, retry_after_secs = retry_after.as_secs(), "rate limit exceeded");
            ApiError::rate_limited(retry_after_seconds(retry_after)).into_response()
        }
    }
}

fn retry_after_seconds(retry_after: Duration) -> u64 {
    let rounded_up = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    rounded_up.max(1)
}

fn client_identity(state: &AppState, request: &Request) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let forwarded = state
        .trust_proxy_headers
        .then(|| extract_client_ip(request.headers()))
        .flatten();

    forwarded
        .or(peer)
        .unwrap_or_else(|| "unknown".to_string())
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .and_then(non_empty)
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for")
        && let Some(first_ip) = forwarded.split(',').next().and_then(non_empty)
    {
        return Some(first_ip.to_string());
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

async fn resolve_link(
    State(state): State<AppState>,
    request: DownloadRequest,
) -> Result<Response, ApiError> {
    let Some(source_url) = request.url.as_deref().and_then(non_empty) else {
        debug!("resolve request without url");
        return Err(ApiError::bad_request("URL is required"));
    };
    if !is_http_url(source_url) {
        debug!(%source_url, "resolve request with malformed url");
        return Err(ApiError::bad_request("Enter a valid http(s) URL"));
    }

    info!(%source_url, "received request to resolve");

    match state.resolver.resolve(source_url).await {
        Ok(direct_url) => Ok(Json(ResolvedMedia {
            direct_url,
            url: source_url.to_string(),
        })
        .into_response()),
        Err(ResolveError::NotFound) => {
            info!(%source_url, "no video url returned");
            let location = format!("/?error={}", urlencoding::encode(NO_VIDEO_FOUND));
            Ok(Redirect::to(&location).into_response())
        }
        Err(ResolveError::Failed(detail)) => {
            let message = if state.expose_error_details {
                detail
            } else {
                GENERIC_RESOLVE_FAILURE.to_string()
            };
            Err(ApiError::resolution_failed(message))
        }
    }
}

async fn stream_media(
    State(state): State<AppState>,
    query: Result<Query<StreamRequest>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(request) = query.map_err(|rejection| {
        debug!(detail = %rejection.body_text(), "stream request with unreadable query");
        ApiError::bad_request("Video URL is invalid")
    })?;

    let download = state
        .proxy
        .open(request.media_url.as_deref())
        .await
        .map_err(stream_error)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&download.content_type)
            .map_err(|_| ApiError::internal("Could not build the content type header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&download.content_disposition())
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    if let Some(length) = download.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    info!(filename = %download.filename, "streaming media download");
    Ok((headers, Body::from_stream(download.body)).into_response())
}

fn stream_error(error: ProxyError) -> ApiError {
    match error {
        ProxyError::MissingUrl => ApiError::bad_request("Video URL is required"),
        ProxyError::InvalidUrl(detail) => {
            debug!(%detail, "stream request with malformed url");
            ApiError::bad_request("Video URL is invalid")
        }
        ProxyError::Timeout(_) => ApiError::download_timeout(),
        other => {
            warn!(error = %other, "error downloading video");
            ApiError::download_failed()
        }
    }
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .ok()
        .is_some_and(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": VERSION }))
}

async fn redirect_home() -> Redirect {
    Redirect::to("/")
}

async fn landing_page(query: Result<Query<LandingQuery>, QueryRejection>) -> Html<String> {
    let error = query
        .ok()
        .and_then(|Query(query)| query.error);
    let error = error
        .as_deref()
        .and_then(non_empty)
        .map(|message| format!("<p class=\"error\">{}</p>", escape_html(message)))
        .unwrap_or_default();

    Html(LANDING_PAGE.replace("{{error}}", &error))
}

// Only the error banner is dynamic, so a small escaper stands in for a template engine.
fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(character),
        }
    }
    escaped
}

const LANDING_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>clipgrab</title>
</head>
<body>
<h1>Download a video without watermark</h1>
{{error}}
<form id="resolve">
  <input type="url" name="url" placeholder="Paste a video link" required>
  <button type="submit">Get video</button>
</form>
<p id="result"></p>
<script>
document.getElementById("resolve").addEventListener("submit", async (event) => {
  event.preventDefault();
  const result = document.getElementById("result");
  const url = new FormData(event.target).get("url");
  const response = await fetch("/resolve", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify({ url }),
  });
  if (response.redirected) {
    window.location = response.url;
    return;
  }
  const payload = await response.json();
  result.textContent = "";
  if (!response.ok) {
    result.textContent = payload.error;
    return;
  }
  const link = document.createElement("a");
  link.href = "/stream?mediaUrl=" + encodeURIComponent(payload.directUrl);
  link.textContent = "Download";
  result.appendChild(link);
});
</script>
</body>
</html>
"#;
