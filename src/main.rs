use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use clipgrab::{
    AdmissionController, ApiError, AppState, Config, DownloadProxy, HttpFetcher, LinkResolver,
    YtDlpExtractor, router,
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "clipgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    if config.expose_error_details {
        warn!("Error details are exposed to clients. Do not run this way in production.");
    }
    if !config.trust_proxy_headers {
        info!("TRUST_PROXY_HEADERS=false: the socket IP identifies clients for rate limiting.");
    }

    let fetcher = HttpFetcher::new(config.download_timeout)
        .map_err(|error| ApiError::internal(format!("Could not create HTTP client: {error}")))?;
    let admission = Arc::new(AdmissionController::new(
        config.rate_limit_max,
        config.rate_limit_window,
    ));

    let state = AppState {
        resolver: LinkResolver::new(
            Arc::new(YtDlpExtractor::new(config.yt_dlp_path.clone())),
            config.resolve_timeout,
        ),
        proxy: DownloadProxy::new(
            Arc::new(fetcher),
            config.download_timeout,
            config.max_download_bytes,
        ),
        admission: Arc::clone(&admission),
        expose_error_details: config.expose_error_details,
        trust_proxy_headers: config.trust_proxy_headers,
    };

    spawn_admission_sweeper(admission, config.rate_limit_window);

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        limit = config.rate_limit_max,
        window_secs = config.rate_limit_window.as_secs(),
        "Server running on http://{}",
        config.bind_addr
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Periodically drops rate-limit windows that have run out.
fn spawn_admission_sweeper(admission: Arc<AdmissionController>, window: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(window.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = admission.prune();
            debug!(removed, tracked = admission.tracked_clients(), "admission sweep");
        }
    });
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        info!("ALLOWED_ORIGINS is not set. Any origin may call the API.");
        return Ok(base.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        origin
            .to_str()
            .ok()
            .and_then(normalize_origin)
            .is_some_and(|value| allowed_origins.contains(&value))
    });

    Ok(base.allow_origin(allow_origin))
}

/// Canonical `scheme://host[:port]` for a bare http(s) origin.
fn normalize_origin(value: &str) -> Option<String> {
    let origin = Url::parse(value).ok()?;
    let bare = origin.path() == "/" && origin.query().is_none() && origin.fragment().is_none();
    if !bare || !matches!(origin.scheme(), "http" | "https") {
        return None;
    }

    // `Url` lowercases the host and reports a scheme's default port as `None`.
    let authority = match (origin.host_str()?, origin.port()) {
        (host, Some(port)) => format!("{host}:{port}"),
        (host, None) => host.to_string(),
    };
    Some(format!("{}://{authority}", origin.scheme()))
}
