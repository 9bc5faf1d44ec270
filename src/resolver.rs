//! Source-link resolution.
//!
//! [`LinkResolver`] wraps a [`MediaExtractor`] (the opaque capability that turns
//! a social-media page URL into a direct media URL) and folds its outcome into
//! exactly one of success, [`ResolveError::NotFound`] or [`ResolveError::Failed`].

use std::{io::ErrorKind, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("extractor executable not found: {0}")]
    MissingExecutable(String),

    #[error("could not run extractor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{0}")]
    Rejected(String),

    #[error("extractor output is not valid UTF-8")]
    InvalidOutput,
}

/// Capability that finds the direct media URL behind a source page.
///
/// `Ok(None)` means the extraction ran fine but found nothing to download.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract(&self, source_url: &str) -> Result<Option<String>, ExtractorError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No video found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

#[derive(Clone)]
pub struct LinkResolver {
    extractor: Arc<dyn MediaExtractor>,
    deadline: Duration,
}

impl LinkResolver {
    pub fn new(extractor: Arc<dyn MediaExtractor>, deadline: Duration) -> Self {
        Self {
            extractor,
            deadline,
        }
    }

    /// Runs the extractor once. No retries.
    #[instrument(skip(self))]
    pub async fn resolve(&self, source_url: &str) -> Result<String, ResolveError> {
        let outcome = timeout(self.deadline, self.extractor.extract(source_url))
            .await
            .map_err(|_| {
                error!(deadline_secs = self.deadline.as_secs(), "extractor timed out");
                ResolveError::Failed(format!(
                    "Resolution timed out after {} seconds",
                    self.deadline.as_secs()
                ))
            })?;

        match outcome {
            Ok(Some(link)) if !link.trim().is_empty() => {
                debug!(direct_url = %link.trim(), "resolved media link");
                Ok(link.trim().to_string())
            }
            Ok(_) => {
                info!("extractor found no media");
                Err(ResolveError::NotFound)
            }
            Err(err) => {
                error!(error = %err, "extractor failed");
                Err(ResolveError::Failed(err.to_string()))
            }
        }
    }
}

/// Extractor backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: String,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn extract(&self, source_url: &str) -> Result<Option<String>, ExtractorError> {
        // kill_on_drop: a caller that gives up (deadline, disconnect) also kills the child.
        let output = Command::new(&self.program)
            .args([
                "--get-url",
                "--format",
                "best",
                "--no-playlist",
                "--no-warnings",
                source_url,
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ExtractorError::MissingExecutable(self.program.clone())
                } else {
                    ExtractorError::Spawn(err)
                }
            })?;

        if !output.status.success() {
            return Err(ExtractorError::Rejected(run_error_message(&output.stderr)));
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| ExtractorError::InvalidOutput)?;
        Ok(first_link(&stdout))
    }
}

fn first_link(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the extraction")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL".to_string()
    } else {
        message
    }
}
