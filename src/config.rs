use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 15 * 60;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RESOLVE_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 250 * 1024 * 1024;
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub expose_error_details: bool,
    pub trust_proxy_headers: bool,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub download_timeout: Duration,
    pub resolve_timeout: Duration,
    pub max_download_bytes: u64,
    pub yt_dlp_path: String,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            expose_error_details: false,
            trust_proxy_headers: false,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            resolve_timeout: Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECONDS),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            yt_dlp_path: DEFAULT_YT_DLP_PATH.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let development = lookup("APP_ENV")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("development"));
        let expose_error_details = lookup("EXPOSE_ERROR_DETAILS")
            .as_deref()
            .and_then(parse_bool)
            .unwrap_or(development);

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            expose_error_details,
            trust_proxy_headers: lookup("TRUST_PROXY_HEADERS")
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(defaults.trust_proxy_headers),
            rate_limit_max: read_positive(&lookup, "RATE_LIMIT_MAX")
                .unwrap_or(defaults.rate_limit_max),
            rate_limit_window: read_positive(&lookup, "RATE_LIMIT_WINDOW_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            download_timeout: read_positive(&lookup, "DOWNLOAD_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            resolve_timeout: read_positive(&lookup, "RESOLVE_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.resolve_timeout),
            max_download_bytes: read_positive(&lookup, "MAX_DOWNLOAD_BYTES")
                .unwrap_or(defaults.max_download_bytes),
            yt_dlp_path: lookup("YT_DLP_PATH")
                .as_deref()
                .and_then(non_empty)
                .map(ToString::to_string)
                .unwrap_or(defaults.yt_dlp_path),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    let port = lookup("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn read_positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
