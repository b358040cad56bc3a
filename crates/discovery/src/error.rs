use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("{url} did not load within {}s", .timeout.as_secs_f32())]
    Timeout { url: String, timeout: Duration },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} is unreachable")]
    Unreachable { url: String },

    #[error("{url} served only {bytes} bytes of content")]
    TrivialContent { url: String, bytes: usize },

    #[error("too many redirects from {url}")]
    TooManyRedirects { url: String },

    #[error("invalid endpoint url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no discovery endpoints configured")]
    NoEndpoints,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DiscoveryError {
    pub(crate) fn from_reqwest(url: &str, timeout: Duration, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                timeout,
            }
        } else if source.is_connect() {
            Self::Unreachable {
                url: url.to_string(),
            }
        } else {
            Self::Http {
                url: url.to_string(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
