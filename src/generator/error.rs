//! Error types for image generation with retry classification.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Classification of image generation errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageGenErrorKind {
    /// Provider misconfigured (missing key, base URL, unknown endpoint type)
    #[error("configuration error")]
    Config,
    /// Rate limited (429 or a rate-limit message in the body)
    #[error("rate limited")]
    RateLimited,
    /// Connection failed before a response arrived
    #[error("network error")]
    Network,
    /// Request exceeded its timeout
    #[error("timeout")]
    Timeout,
    /// 5xx from the provider
    #[error("server error")]
    ServerError,
    /// 4xx other than 429 (bad request, auth, content policy)
    #[error("client error")]
    ClientError,
    /// Body could not be parsed
    #[error("parse error")]
    Parse,
    /// Body parsed but carried no image
    #[error("missing image")]
    MissingImage,
    /// Adapter retry budget exhausted
    #[error("retries exhausted")]
    Exhausted,
}

/// Image generation error with retry metadata.
#[derive(Debug, Clone, Error)]
#[error("{kind}{}: {message}", http_suffix(.status))]
pub struct ImageGenError {
    pub kind: ImageGenErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Server-provided `Retry-After`
    pub retry_after: Option<Duration>,
}

fn http_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" (HTTP {})", s))
        .unwrap_or_default()
}

impl ImageGenError {
    fn new(kind: ImageGenErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ImageGenErrorKind::Config, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(429),
            retry_after,
            ..Self::new(ImageGenErrorKind::RateLimited, message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ImageGenErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ImageGenErrorKind::Timeout, message)
    }

    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ImageGenErrorKind::ServerError, message)
        }
    }

    pub fn client_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ImageGenErrorKind::ClientError, message)
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ImageGenErrorKind::Parse, message)
    }

    pub fn missing_image(message: impl Into<String>) -> Self {
        Self::new(ImageGenErrorKind::MissingImage, message)
    }

    /// Terminal error after the adapter gave up.
    pub fn exhausted(attempts: u32, last: &ImageGenError) -> Self {
        Self::new(
            ImageGenErrorKind::Exhausted,
            format!(
                "Image generation failed after {} attempts (last error: {}). \
                 Likely causes: the provider quota is used up or it keeps rate limiting, \
                 the network connection is unstable, or the provider is temporarily unavailable. \
                 Try again later or check the API quota and network.",
                attempts, last
            ),
        )
    }

    /// Build an error from a reqwest failure, separating timeouts from other network errors.
    pub fn from_reqwest(context: &str, e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("{} timed out: {}", context, e))
        } else if e.is_connect() {
            Self::network(format!("{} connection failed: {}", context, e))
        } else {
            Self::network(format!("{} failed: {}", context, e))
        }
    }

    /// Build an error from a non-success response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let detail: String = body.chars().take(500).collect();
        if is_rate_limit_body(body) && status != 429 && status < 500 {
            return Self {
                status: Some(status),
                ..Self::rate_limited(detail, retry_after)
            };
        }
        match classify_http_status(status) {
            ImageGenErrorKind::RateLimited => Self::rate_limited(detail, retry_after),
            ImageGenErrorKind::ServerError => Self::server_error(status, detail),
            _ => Self::client_error(status, detail),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ImageGenErrorKind::RateLimited
                | ImageGenErrorKind::Network
                | ImageGenErrorKind::Timeout
                | ImageGenErrorKind::ServerError
        )
    }

    /// Delay before the next attempt. `attempt` is zero-based.
    pub fn suggested_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        match self.kind {
            ImageGenErrorKind::RateLimited => {
                let base = config.base_delay.as_secs_f64().powi(attempt as i32);
                let jitter = if config.jitter {
                    rand::random::<f64>()
                } else {
                    0.0
                };
                let backoff = Duration::from_secs_f64(base + jitter);
                match self.retry_after {
                    Some(server) if server > backoff => server,
                    _ => backoff,
                }
            }
            _ => Duration::from_secs(1u64 << attempt.min(6)),
        }
    }
}

/// Classify an HTTP status code.
fn classify_http_status(status: u16) -> ImageGenErrorKind {
    match status {
        429 => ImageGenErrorKind::RateLimited,
        500..=599 => ImageGenErrorKind::ServerError,
        _ => ImageGenErrorKind::ClientError,
    }
}

/// Whether a response body looks like a rate-limit message.
fn is_rate_limit_body(body: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\brate[ _-]?limit|too many requests|\b429\b").ok())
        .as_ref()
        .map(|re| re.is_match(body))
        .unwrap_or(false)
}

/// Adapter-level retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base of the exponential rate-limit backoff
    pub base_delay: Duration,
    /// Add up to one second of random jitter to rate-limit waits
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &ImageGenError) -> bool {
        error.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(429), ImageGenErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), ImageGenErrorKind::ServerError);
        assert_eq!(classify_http_status(400), ImageGenErrorKind::ClientError);
        assert_eq!(classify_http_status(401), ImageGenErrorKind::ClientError);
    }

    #[test]
    fn test_rate_limit_body() {
        assert!(is_rate_limit_body("Rate limit exceeded"));
        assert!(is_rate_limit_body("rate_limit_error"));
        assert!(is_rate_limit_body("Too Many Requests"));
        assert!(is_rate_limit_body("upstream returned 429"));
        assert!(!is_rate_limit_body("generation rated unsafe"));
        assert!(!is_rate_limit_body("invalid model"));
    }

    #[test]
    fn test_from_status_detects_rate_limit_body() {
        let err = ImageGenError::from_status(400, "{\"error\":\"rate limit reached\"}", None);
        assert_eq!(err.kind, ImageGenErrorKind::RateLimited);
        assert_eq!(err.status, Some(400));

        let err = ImageGenError::from_status(400, "bad prompt", None);
        assert_eq!(err.kind, ImageGenErrorKind::ClientError);
        assert!(!RetryConfig::default().should_retry(&err));

        let err = ImageGenError::from_status(502, "bad gateway", None);
        assert!(RetryConfig::default().should_retry(&err));
    }

    #[test]
    fn test_display_includes_status_when_known() {
        let err = ImageGenError::from_status(503, "overloaded", None);
        assert_eq!(err.to_string(), "server error (HTTP 503): overloaded");

        let err = ImageGenError::network("reset");
        assert_eq!(err.to_string(), "network error: reset");
        assert_eq!(ImageGenErrorKind::Exhausted.to_string(), "retries exhausted");
    }

    #[test]
    fn test_suggested_delay() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };

        let rate = ImageGenError::rate_limited("slow down", None);
        assert_eq!(rate.suggested_delay(0, &config), Duration::from_secs(1));
        assert_eq!(rate.suggested_delay(2, &config), Duration::from_secs(9));

        let rate = ImageGenError::rate_limited("slow down", Some(Duration::from_secs(30)));
        assert_eq!(rate.suggested_delay(1, &config), Duration::from_secs(30));

        let net = ImageGenError::network("reset");
        assert_eq!(net.suggested_delay(0, &config), Duration::from_secs(1));
        assert_eq!(net.suggested_delay(3, &config), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_under_one_second() {
        let config = RetryConfig::default();
        let rate = ImageGenError::rate_limited("slow down", None);
        for _ in 0..20 {
            let delay = rate.suggested_delay(1, &config);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay < Duration::from_secs(4));
        }
    }

    #[test]
    fn test_exhausted_names_causes() {
        let last = ImageGenError::network("reset");
        let err = ImageGenError::exhausted(5, &last);
        assert_eq!(err.kind, ImageGenErrorKind::Exhausted);
        assert!(err.message.contains("quota"));
        assert!(err.message.contains("network"));
        assert!(err.message.contains("unavailable"));
    }
}
