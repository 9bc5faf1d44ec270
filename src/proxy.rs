//! Streaming download proxy.
//!
//! [`DownloadProxy::open`] fetches a direct media URL under a deadline and hands
//! back a [`MediaDownload`]: the synthesized attachment headers plus a body
//! stream that relays upstream chunks as they arrive. A single
//! [`CancellationToken`] ties the whole transfer together. The deadline, an idle
//! body, the byte cap or a dropped client all cancel it, and the upstream
//! request is torn down with it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{body::Bytes, http::StatusCode};
use futures_util::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";
const DOWNLOAD_ID_LEN: usize = 10;
const USER_AGENT: &str = concat!("clipgrab/", env!("CARGO_PKG_VERSION"));

pub type UpstreamBody = BoxStream<'static, Result<Bytes, FetchError>>;
pub type RelayBody = BoxStream<'static, Result<Bytes, ProxyError>>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("media URL is required")]
    MissingUrl,

    #[error("media URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("no response within {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("upstream responded with {0}")]
    UpstreamStatus(StatusCode),

    #[error("media exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("upstream stalled for {} seconds", .0.as_secs())]
    IdleTimeout(Duration),

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ProxyError {
    /// Input problems, rejected before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingUrl | Self::InvalidUrl(_))
    }
}

/// Response head plus body handed back by a [`MediaFetcher`].
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: UpstreamBody,
}

/// Capability that issues the outbound request for a media URL.
///
/// Implementations must stop work once `cancel` fires, both while waiting for
/// the response head and while producing the body.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        cancel: CancellationToken,
    ) -> Result<UpstreamResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        cancel: CancellationToken,
    ) -> Result<UpstreamResponse, FetchError> {
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = self.client.get(url.clone()).send() => result?,
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        Ok(UpstreamResponse {
            status: response.status(),
            content_type,
            content_length: response.content_length(),
            body: response
                .bytes_stream()
                .map_err(FetchError::from)
                .take_until(cancel.cancelled_owned())
                .boxed(),
        })
    }
}

/// A download ready to be relayed to the client.
pub struct MediaDownload {
    pub filename: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: RelayBody,
}

impl MediaDownload {
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.filename)
    }
}

#[derive(Clone)]
pub struct DownloadProxy {
    fetcher: Arc<dyn MediaFetcher>,
    timeout: Duration,
    max_bytes: u64,
}

impl DownloadProxy {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, timeout: Duration, max_bytes: u64) -> Self {
        Self {
            fetcher,
            timeout,
            max_bytes,
        }
    }

    /// Starts the upstream fetch and returns the relay once headers are in.
    ///
    /// `timeout` bounds the wait for the response head. The same value is the
    /// longest the relay waits for any single body chunk. Downloads hold no
    /// shared resource, so a client that stops reading only stalls itself.
    #[instrument(skip(self))]
    pub async fn open(&self, media_url: Option<&str>) -> Result<MediaDownload, ProxyError> {
        let url = validate_media_url(media_url)?;

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();

        let response = tokio::select! {
            fetched = self.fetcher.fetch(&url, token.clone()) => fetched?,
            () = tokio::time::sleep(self.timeout) => {
                token.cancel();
                warn!(timeout_secs = self.timeout.as_secs(), "media fetch timed out");
                return Err(ProxyError::Timeout(self.timeout));
            }
        };

        if !response.status.is_success() {
            warn!(status = %response.status, "upstream refused media request");
            return Err(ProxyError::UpstreamStatus(response.status));
        }

        if let Some(length) = response.content_length
            && length > self.max_bytes
        {
            warn!(length, limit = self.max_bytes, "upstream media too large");
            return Err(ProxyError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let extension = extension_for_content_type(response.content_type.as_deref());
        let filename = format!("{}.{extension}", download_id());
        let content_type = response
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        debug!(%filename, %content_type, length = ?response.content_length, "relaying media");

        let body = relay(Relay {
            body: response.body,
            token,
            _guard: guard,
            idle_timeout: self.timeout,
            max_bytes: self.max_bytes,
            sent: 0,
            finished: false,
        });

        Ok(MediaDownload {
            filename,
            content_type,
            content_length: response.content_length,
            body,
        })
    }
}

struct Relay {
    body: UpstreamBody,
    token: CancellationToken,
    // Dropping the relay (finished, failed or client gone) cancels the token.
    _guard: DropGuard,
    idle_timeout: Duration,
    max_bytes: u64,
    sent: u64,
    finished: bool,
}

fn relay(relay: Relay) -> RelayBody {
    stream::unfold(relay, |mut relay| async move {
        if relay.finished {
            return None;
        }

        let next = tokio::select! {
            () = relay.token.cancelled() => Err(ProxyError::Cancelled),
            next = tokio::time::timeout(relay.idle_timeout, relay.body.next()) => match next {
                Err(_) => Err(ProxyError::IdleTimeout(relay.idle_timeout)),
                Ok(None) => {
                    debug!(sent = relay.sent, "media relay complete");
                    return None;
                }
                Ok(Some(Err(err))) => Err(ProxyError::Fetch(err)),
                Ok(Some(Ok(chunk))) => Ok(chunk),
            },
        };

        let next = next.and_then(|chunk| {
            relay.sent += chunk.len() as u64;
            if relay.sent > relay.max_bytes {
                Err(ProxyError::TooLarge {
                    limit: relay.max_bytes,
                })
            } else {
                Ok(chunk)
            }
        });

        if let Err(err) = &next {
            warn!(error = %err, sent = relay.sent, "media relay aborted");
            relay.finished = true;
            relay.token.cancel();
        }

        Some((next, relay))
    })
    .boxed()
}

pub fn validate_media_url(media_url: Option<&str>) -> Result<Url, ProxyError> {
    let raw = media_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ProxyError::MissingUrl)?;

    let parsed = Url::parse(raw).map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ProxyError::InvalidUrl("missing host".to_string()));
    }

    Ok(parsed)
}

/// Best-effort extension from the declared content type. No byte sniffing.
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("webm") {
        "webm"
    } else if content_type.contains("quicktime") {
        "mov"
    } else {
        "mp4"
    }
}

fn download_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(DOWNLOAD_ID_LEN);
    id
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{sync::Notify, time::Instant};

    use super::*;

    pub(crate) enum Behavior {
        Respond {
            status: StatusCode,
            content_type: Option<&'static str>,
            content_length: Option<u64>,
            chunks: Vec<Bytes>,
            stall_after: bool,
        },
        Hang,
    }

    pub(crate) struct FakeFetcher {
        behavior: Behavior,
        calls: AtomicUsize,
        pub(crate) cancelled: Arc<Notify>,
    }

    impl FakeFetcher {
        pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                cancelled: Arc::new(Notify::new()),
            })
        }

        pub(crate) fn ok(content_type: Option<&'static str>, chunks: Vec<Bytes>) -> Arc<Self> {
            Self::new(Behavior::Respond {
                status: StatusCode::OK,
                content_type,
                content_length: None,
                chunks,
                stall_after: false,
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _url: &Url,
            cancel: CancellationToken,
        ) -> Result<UpstreamResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let cancelled = Arc::clone(&self.cancelled);
            let watched = cancel.clone();
            tokio::spawn(async move {
                watched.cancelled().await;
                cancelled.notify_one();
            });

            match &self.behavior {
                Behavior::Hang => std::future::pending().await,
                Behavior::Respond {
                    status,
                    content_type,
                    content_length,
                    chunks,
                    stall_after,
                } => {
                    let chunks = chunks
                        .iter()
                        .cloned()
                        .map(Ok::<_, FetchError>)
                        .collect::<Vec<_>>();
                    let body = if *stall_after {
                        stream::iter(chunks).chain(stream::pending()).boxed()
                    } else {
                        stream::iter(chunks).boxed()
                    };
                    Ok(UpstreamResponse {
                        status: *status,
                        content_type: content_type.map(ToString::to_string),
                        content_length: *content_length,
                        body,
                    })
                }
            }
        }
    }

    fn proxy(fetcher: Arc<FakeFetcher>) -> DownloadProxy {
        DownloadProxy::new(fetcher, Duration::from_secs(30), 1024)
    }

    async fn drain(body: RelayBody) -> (Vec<u8>, Option<ProxyError>) {
        let mut body = body;
        let mut bytes = Vec::new();
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => return (bytes, Some(err)),
            }
        }
        (bytes, None)
    }

    #[tokio::test]
    async fn missing_or_malformed_url_makes_no_network_call() {
        let fetcher = FakeFetcher::ok(None, vec![Bytes::from_static(b"x")]);
        let proxy = proxy(fetcher.clone());

        for input in [None, Some(""), Some("   "), Some("not a url"), Some("ftp://host/file")] {
            let err = proxy.open(input).await.err().expect("must be rejected");
            assert!(err.is_validation(), "{input:?} gave {err:?}");
        }
        assert!(matches!(proxy.open(None).await, Err(ProxyError::MissingUrl)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn relays_body_with_synthesized_headers() {
        let fetcher = FakeFetcher::ok(
            Some("video/webm"),
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")],
        );
        let download = proxy(fetcher.clone())
            .open(Some("https://cdn.example/v"))
            .await
            .expect("download opens");

        assert_eq!(download.content_type, "video/webm");
        assert!(download.filename.ends_with(".webm"));
        assert_eq!(download.filename.len(), DOWNLOAD_ID_LEN + ".webm".len());
        assert_eq!(
            download.content_disposition(),
            format!("attachment; filename=\"{}\"", download.filename)
        );

        let (bytes, err) = drain(download.body).await;
        assert_eq!(bytes, b"abcdef");
        assert!(err.is_none());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn absent_content_type_falls_back_to_mp4() {
        let download = proxy(FakeFetcher::ok(None, vec![Bytes::from_static(b"a")]))
            .open(Some("https://cdn.example/v"))
            .await
            .expect("download opens");

        assert_eq!(download.content_type, DEFAULT_CONTENT_TYPE);
        assert!(download.filename.ends_with(".mp4"));
    }

    #[test]
    fn extension_follows_declared_type() {
        assert_eq!(extension_for_content_type(Some("video/webm")), "webm");
        assert_eq!(extension_for_content_type(Some("video/quicktime")), "mov");
        assert_eq!(extension_for_content_type(Some("Video/QuickTime; q=1")), "mov");
        assert_eq!(extension_for_content_type(Some("video/mp4")), "mp4");
        assert_eq!(extension_for_content_type(Some("application/octet-stream")), "mp4");
        assert_eq!(extension_for_content_type(None), "mp4");
    }

    #[test]
    fn download_ids_are_short_and_distinct() {
        let a = download_id();
        let b = download_id();
        assert_eq!(a.len(), DOWNLOAD_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out_and_cancels_the_fetch() {
        let fetcher = FakeFetcher::new(Behavior::Hang);
        let proxy = proxy(fetcher.clone());

        let started = Instant::now();
        let result = proxy.open(Some("https://cdn.example/slow")).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ProxyError::Timeout(_))));
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));

        tokio::time::timeout(Duration::from_secs(1), fetcher.cancelled.notified())
            .await
            .expect("fetch was cancelled");
    }

    #[tokio::test]
    async fn failing_upstream_status_relays_nothing() {
        let fetcher = FakeFetcher::new(Behavior::Respond {
            status: StatusCode::FORBIDDEN,
            content_type: Some("text/html"),
            content_length: None,
            chunks: vec![Bytes::from_static(b"denied")],
            stall_after: false,
        });

        let result = proxy(fetcher.clone()).open(Some("https://cdn.example/v")).await;

        assert!(matches!(
            result,
            Err(ProxyError::UpstreamStatus(StatusCode::FORBIDDEN))
        ));
        tokio::time::timeout(Duration::from_secs(1), fetcher.cancelled.notified())
            .await
            .expect("upstream request released");
    }

    #[tokio::test]
    async fn declared_length_over_cap_is_rejected_up_front() {
        let fetcher = FakeFetcher::new(Behavior::Respond {
            status: StatusCode::OK,
            content_type: Some("video/mp4"),
            content_length: Some(4096),
            chunks: vec![Bytes::from_static(b"x")],
            stall_after: false,
        });

        let result = proxy(fetcher).open(Some("https://cdn.example/v")).await;
        assert!(matches!(result, Err(ProxyError::TooLarge { limit: 1024 })));
    }

    #[tokio::test]
    async fn relay_stops_with_error_past_byte_cap() {
        let big = Bytes::from(vec![0u8; 700]);
        let fetcher = FakeFetcher::ok(Some("video/mp4"), vec![big.clone(), big.clone(), big]);

        let download = proxy(fetcher)
            .open(Some("https://cdn.example/v"))
            .await
            .expect("download opens");
        let (bytes, err) = drain(download.body).await;

        assert_eq!(bytes.len(), 700);
        assert!(matches!(err, Some(ProxyError::TooLarge { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_fails_instead_of_truncating() {
        let fetcher = FakeFetcher::new(Behavior::Respond {
            status: StatusCode::OK,
            content_type: Some("video/mp4"),
            content_length: None,
            chunks: vec![Bytes::from_static(b"partial")],
            stall_after: true,
        });

        let download = proxy(fetcher.clone())
            .open(Some("https://cdn.example/v"))
            .await
            .expect("download opens");
        let (bytes, err) = drain(download.body).await;

        assert_eq!(bytes, b"partial");
        assert!(matches!(err, Some(ProxyError::IdleTimeout(_))));
        tokio::time::timeout(Duration::from_secs(1), fetcher.cancelled.notified())
            .await
            .expect("relay cancelled the fetch");
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_transfer() {
        let fetcher = FakeFetcher::new(Behavior::Respond {
            status: StatusCode::OK,
            content_type: None,
            content_length: None,
            chunks: vec![Bytes::from_static(b"a")],
            stall_after: true,
        });

        let download = proxy(fetcher.clone())
            .open(Some("https://cdn.example/v"))
            .await
            .expect("download opens");
        drop(download);

        tokio::time::timeout(Duration::from_secs(1), fetcher.cancelled.notified())
            .await
            .expect("client disconnect cancelled the fetch");
    }

    #[tokio::test(start_paused = true)]
    async fn unread_downloads_do_not_block_new_ones() {
        let fetcher = FakeFetcher::ok(Some("video/mp4"), vec![Bytes::from_static(b"a")]);
        let proxy = proxy(fetcher.clone());

        let mut idle = Vec::new();
        for _ in 0..5 {
            idle.push(
                proxy
                    .open(Some("https://cdn.example/v"))
                    .await
                    .expect("download opens"),
            );
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;

        let started = Instant::now();
        let download = proxy
            .open(Some("https://cdn.example/other"))
            .await
            .expect("idle clients must not hold up other downloads");
        assert!(started.elapsed() < Duration::from_secs(1));

        let (bytes, err) = drain(download.body).await;
        assert_eq!(bytes, b"a");
        assert!(err.is_none());
        assert_eq!(fetcher.calls(), 6);
        drop(idle);
    }
}
