use std::io;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};

use revchat_provider_core::{AttemptFailure, GatewayError, PoolMark};

use crate::orchestrator::ByteStream;

/// Markers of a Cloudflare-class interstitial; these arrive as 403 bodies
/// that say nothing about the credential itself.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "Just a moment",
    "Attention Required",
    "_cf_chl_opt",
];

pub fn is_challenge_body(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

pub fn network_failure(err: wreq::Error) -> AttemptFailure {
    AttemptFailure::bare(GatewayError::Connection(err.to_string()))
}

/// Map a non-success upstream status to a failed attempt plus the pool
/// transition it justifies.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> AttemptFailure {
    match status {
        StatusCode::FORBIDDEN if is_challenge_body(body) => {
            AttemptFailure::bare(GatewayError::TransportChallenge)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AttemptFailure {
            error: GatewayError::CredentialInvalid(format!("upstream status {}", status.as_u16())),
            mark: Some(PoolMark::Invalid {
                reason: format!("auth_error {}", status.as_u16()),
            }),
        },
        StatusCode::TOO_MANY_REQUESTS => AttemptFailure {
            error: GatewayError::RateLimited(format!("upstream status {}", status.as_u16())),
            mark: Some(PoolMark::Cooldown {
                duration: retry_after_seconds(headers).map(Duration::from_secs),
                reason: "rate_limit".to_string(),
            }),
        },
        other => AttemptFailure::bare(GatewayError::Connection(format!(
            "upstream status {}",
            other.as_u16()
        ))),
    }
}

/// Turn a sent request into the raw byte stream, classifying non-success
/// statuses into attempt failures first.
pub async fn open_stream(response: wreq::Response) -> Result<ByteStream, AttemptFailure> {
    let status = response.status();
    if !status.is_success() {
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &headers, &body));
    }
    Ok(Box::pin(response.bytes_stream().map(|item| {
        item.map_err(|err| io::Error::other(err.to_string()))
    })))
}

fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let value = value.trim();
            if let Ok(seconds) = value.parse::<u64>() {
                return Some(seconds);
            }
            if let Ok(when) = httpdate::parse_http_date(value) {
                return when
                    .duration_since(SystemTime::now())
                    .ok()
                    .map(|duration| duration.as_secs());
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_with_challenge_markers_is_transport_level() {
        let failure = classify_status(
            StatusCode::FORBIDDEN,
            &HeaderMap::new(),
            "<html>Just a moment...<div id=\"challenge-platform\"></div></html>",
        );
        assert!(matches!(failure.error, GatewayError::TransportChallenge));
        assert!(failure.mark.is_none());
    }

    #[test]
    fn plain_forbidden_invalidates_the_credential() {
        let failure = classify_status(StatusCode::FORBIDDEN, &HeaderMap::new(), "forbidden");
        assert!(matches!(failure.error, GatewayError::CredentialInvalid(_)));
        assert!(matches!(failure.mark, Some(PoolMark::Invalid { .. })));
    }

    #[test]
    fn too_many_requests_honors_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "120".parse().unwrap());
        let failure = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        match failure.mark {
            Some(PoolMark::Cooldown { duration, .. }) => {
                assert_eq!(duration, Some(Duration::from_secs(120)));
            }
            other => panic!("unexpected mark: {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_connection_class() {
        let failure = classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), "");
        assert!(matches!(failure.error, GatewayError::Connection(_)));
        assert!(failure.mark.is_none());
    }
}
