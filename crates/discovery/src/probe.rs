use std::time::Duration;

use {
    async_trait::async_trait,
    reqwest::{
        Client,
        header::{CONTENT_TYPE, LOCATION},
        redirect::Policy,
    },
    tokio::{net::TcpStream, time::Instant},
    tracing::debug,
    url::Url,
};

use crate::error::{DiscoveryError, Result};

const MAX_REDIRECTS: u8 = 5;
/// Enough body to judge whether a page has real content.
const MAX_INSPECT_BYTES: usize = 64 * 1024;

/// What a successful load produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedContent {
    /// Readable text; `bytes` excludes surrounding whitespace and is capped
    /// at the inspected prefix of the body.
    Inspectable { bytes: usize },
    /// Loaded, but nothing we can look inside (another origin, or binary).
    Opaque,
}

/// Loads an interface endpoint and reports what came back.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Cheap TCP reachability check.
    async fn reachable(&self, url: &Url, timeout: Duration) -> bool;

    async fn load(&self, url: &Url, timeout: Duration) -> Result<LoadedContent>;
}

pub struct HttpProbe {
    client: Client,
    max_redirects: u8,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        // Redirects are followed by hand so origin changes can be seen.
        let client = Client::builder()
            .redirect(Policy::none())
            .no_proxy()
            .build()
            .map_err(DiscoveryError::Client)?;
        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("text/")
        || ["html", "json", "xml", "javascript"]
            .iter()
            .any(|kind| mime.contains(kind))
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn reachable(&self, url: &Url, timeout: Duration) -> bool {
        let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn load(&self, url: &Url, timeout: Duration) -> Result<LoadedContent> {
        let deadline = Instant::now() + timeout;
        let mut current = url.clone();
        let mut hops = 0u8;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DiscoveryError::Timeout {
                    url: url.to_string(),
                    timeout,
                });
            }

            let mut response = self
                .client
                .get(current.as_str())
                .timeout(remaining)
                .send()
                .await
                .map_err(|e| DiscoveryError::from_reqwest(current.as_str(), timeout, e))?;
            let status = response.status();

            if status.is_redirection() {
                if hops >= self.max_redirects {
                    return Err(DiscoveryError::TooManyRedirects {
                        url: url.to_string(),
                    });
                }
                let Some(next) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                else {
                    return Err(DiscoveryError::Status {
                        url: current.to_string(),
                        status: status.as_u16(),
                    });
                };
                if next.origin() != current.origin() {
                    debug!(from = %current, to = %next, "cross-origin redirect, content not inspectable");
                    return Ok(LoadedContent::Opaque);
                }
                current = next;
                hops += 1;
                continue;
            }

            if !status.is_success() {
                return Err(DiscoveryError::Status {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !is_textual(&content_type) {
                debug!(url = %current, %content_type, "non-text content, not inspectable");
                return Ok(LoadedContent::Opaque);
            }

            let mut body = Vec::new();
            while body.len() < MAX_INSPECT_BYTES {
                match response
                    .chunk()
                    .await
                    .map_err(|e| DiscoveryError::from_reqwest(current.as_str(), timeout, e))?
                {
                    Some(chunk) => body.extend_from_slice(&chunk),
                    None => break,
                }
            }
            body.truncate(MAX_INSPECT_BYTES);
            return Ok(LoadedContent::Inspectable {
                bytes: body.trim_ascii().len(),
            });
        }
    }
}
