//! HTTP access to upstream content APIs
//!
//! Provides the [`UpstreamClient`] seam used by the fetcher and the content
//! validator, its reqwest implementation, and the tagged decode step for
//! upstream response bodies.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Accept header sent with every upstream request
pub const ACCEPT_MEDIA: &str = "image/gif, image/webp, video/mp4, */*";

/// Why a single fetch attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS or TLS problem
    #[error("network error: {0}")]
    Network(String),
    /// Attempt exceeded its time budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Upstream answered with a non-success status
    #[error("upstream status {0}")]
    Status(u16),
    /// Body did not decode to a known shape with a resource URL
    #[error("unrecognized response: {0}")]
    Decode(String),
    /// Resource does not have the requested media kind
    #[error("resource failed format check: {0}")]
    Validation(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Transport used to reach upstream content APIs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// GET `url` and parse the body as JSON
    async fn get_json(&self, url: &str) -> Result<Value, FetchError>;
    /// Look up the declared content type of a resource
    async fn probe_content_type(&self, url: &str) -> Result<Option<String>, FetchError>;
}

/// One entry of a gallery-shaped response
#[derive(Debug, Deserialize)]
struct GalleryImage {
    url: String,
}

/// Known upstream response shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UpstreamPayload {
    /// `{ "url": "…" }`
    Direct { url: String },
    /// `{ "images": [ { "url": "…" }, … ] }`
    Gallery { images: Vec<GalleryImage> },
}

/// Extract the resource URL from an upstream body.
///
/// Unknown shapes, empty galleries, blank URLs and URLs that are not
/// absolute http(s) locators fail closed.
///
/// # Errors
///
/// Returns `FetchError::Decode` when no usable URL is present.
pub fn decode_resource_url(body: &Value) -> Result<String, FetchError> {
    let payload = UpstreamPayload::deserialize(body)
        .map_err(|_| FetchError::Decode(describe_shape(body)))?;

    let url = match payload {
        UpstreamPayload::Direct { url } => url,
        UpstreamPayload::Gallery { images } => images
            .into_iter()
            .next()
            .map(|image| image.url)
            .ok_or_else(|| FetchError::Decode("empty image list".into()))?,
    };

    let url = url.trim();
    if url.is_empty() {
        return Err(FetchError::Decode("blank resource url".into()));
    }
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some() => {
            Ok(url.to_string())
        }
        Ok(parsed) => Err(FetchError::Decode(format!(
            "unusable resource url scheme {}",
            parsed.scheme()
        ))),
        Err(e) => Err(FetchError::Decode(format!("invalid resource url: {e}"))),
    }
}

fn describe_shape(body: &Value) -> String {
    match body {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).take(5).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        Value::Array(_) => "array".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Null => "null".to_string(),
    }
}

/// reqwest-backed upstream client with a bounded per-request timeout
pub struct HttpUpstream {
    client: HttpClient,
    user_agent: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// Creates a client whose every request is bounded by `timeout`
    #[must_use]
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| HttpClient::new());

        Self {
            client,
            user_agent: user_agent.to_string(),
            timeout,
        }
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        match FetchError::from(e) {
            FetchError::Timeout(_) => FetchError::Timeout(self.timeout),
            other => other,
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, ACCEPT_MEDIA)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response.json().await.map_err(|e| match self.map_error(e) {
            FetchError::Network(msg) => FetchError::Decode(msg),
            other => other,
        })
    }

    async fn probe_content_type(&self, url: &str) -> Result<Option<String>, FetchError> {
        let response = self
            .client
            .head(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, ACCEPT_MEDIA)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_direct_shape() {
        let body = json!({"url": "https://i.waifu.pics/abc.png"});
        assert_eq!(
            decode_resource_url(&body),
            Ok("https://i.waifu.pics/abc.png".to_string())
        );
    }

    #[test]
    fn test_decode_gallery_shape_takes_first() {
        let body = json!({"images": [
            {"url": "https://cdn.waifu.im/1.jpg", "width": 100},
            {"url": "https://cdn.waifu.im/2.jpg"}
        ]});
        assert_eq!(
            decode_resource_url(&body),
            Ok("https://cdn.waifu.im/1.jpg".to_string())
        );
    }

    #[test]
    fn test_decode_fails_closed() {
        for body in [
            json!({"results": [{"url": "https://x.test/a.png"}]}),
            json!({"images": []}),
            json!({"url": "   "}),
            json!({"url": 42}),
            json!({"url": "/relative/img.png"}),
            json!({"url": "javascript:alert(1)"}),
            json!({"images": [{"url": "file:///etc/passwd"}]}),
            json!([{"url": "https://x.test/a.png"}]),
            json!(null),
        ] {
            assert!(matches!(decode_resource_url(&body), Err(FetchError::Decode(_))));
        }
    }

    #[test]
    fn test_describe_shape_lists_keys() {
        let description = describe_shape(&json!({"message": "rate limited"}));
        assert_eq!(description, "object with keys [message]");
    }
}
