//! Resolve social-media video links to direct media URLs and proxy the media
//! back to the client as a forced download.

pub mod admission;
pub mod config;
pub mod error;
pub mod proxy;
pub mod resolver;
pub mod routes;

pub use admission::{Admission, AdmissionController};
pub use config::Config;
pub use error::ApiError;
pub use proxy::{DownloadProxy, HttpFetcher, MediaDownload, MediaFetcher, ProxyError};
pub use resolver::{LinkResolver, MediaExtractor, ResolveError, YtDlpExtractor};
pub use routes::{AppState, router};
