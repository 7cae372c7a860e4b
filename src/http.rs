//! Shared blocking HTTP plumbing for the WCQS and MediaWiki clients.
//!
//! Status-code checks live here so the service modules stay focused on
//! request construction and response mapping.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Errors raised while talking to WCQS or the Wikidata API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure, timeout or undecodable body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status other than 401/403/429.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("unauthorized ({status}); check the WCQS token or bot credentials")]
    Unauthorized { status: u16 },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The MediaWiki action API answered 200 with an `error` object.
    #[error("MediaWiki API error {code}: {info}")]
    MediaWiki { code: String, info: String },

    #[error("parse error: {0}")]
    Parse(String),
}

pub fn user_agent(contact: Option<&str>) -> String {
    let product = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    match contact.map(str::trim).filter(|value| !value.is_empty()) {
        Some(contact) => format!("{product} (Wikidata bot; {contact})"),
        None => format!("{product} (Wikidata bot)"),
    }
}

/// Build a blocking client; the cookie store keeps MediaWiki login sessions.
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client, ClientError> {
    let client = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .cookie_store(true)
        .build()?;
    Ok(client)
}

/// Pass successful responses through and turn everything else into a
/// [`ClientError`].
pub fn check_response(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let retry_after_secs = parse_retry_after(resp.headers());
    let body = resp.text().unwrap_or_default();
    Err(status_error(status, retry_after_secs, body))
}

fn status_error(status: StatusCode, retry_after_secs: u64, body: String) -> ClientError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited { retry_after_secs },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized {
            status: status.as_u16(),
        },
        _ => ClientError::Api {
            status: status.as_u16(),
            message: truncate_message(&body),
        },
    }
}

fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

// WCQS error pages can carry a full Java stack trace.
fn truncate_message(body: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn parse_retry_after_reads_seconds() {
        assert_eq!(parse_retry_after(&headers_with_retry_after("120")), 120);
    }

    #[test]
    fn parse_retry_after_falls_back_when_missing_or_invalid() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), 60);
        assert_eq!(parse_retry_after(&headers_with_retry_after("soon")), 60);
    }

    #[test]
    fn status_error_maps_auth_failures() {
        let err = status_error(StatusCode::FORBIDDEN, 60, String::new());
        assert!(matches!(err, ClientError::Unauthorized { status: 403 }));
    }

    #[test]
    fn status_error_maps_rate_limit_and_server_errors() {
        let err = status_error(StatusCode::TOO_MANY_REQUESTS, 30, String::new());
        assert!(matches!(
            err,
            ClientError::RateLimited {
                retry_after_secs: 30
            }
        ));

        let err = status_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            60,
            "java.util.concurrent.TimeoutException".to_string(),
        );
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("TimeoutException"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let message = truncate_message(&body);
        assert_eq!(message.len(), 515);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn user_agent_includes_contact_when_given() {
        let agent = user_agent(Some("User:Example"));
        assert!(agent.starts_with("sdc-deleted-report/"));
        assert!(agent.ends_with("(Wikidata bot; User:Example)"));
        assert!(user_agent(Some("  ")).ends_with("(Wikidata bot)"));
    }
}
