pub mod grok;
pub mod xai;
pub mod you;

pub use grok::GrokProvider;
pub use xai::XaiProvider;
pub use you::YouProvider;

use http::header::COOKIE;
use http::{HeaderMap, HeaderValue};
use serde_json::Value;

use revchat_provider_core::{AttemptFailure, GatewayError, PoolMark};

pub(crate) fn credential_cookie(secret: &Value) -> Option<String> {
    match secret {
        Value::String(value) => Some(value.clone()),
        other => other
            .get("cookie")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

pub(crate) fn cookie_headers(cookie: &str) -> Result<HeaderMap, AttemptFailure> {
    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(cookie)
            .map_err(|err| missing_secret(&format!("well-formed cookie: {err}")))?,
    );
    Ok(headers)
}

pub(crate) fn missing_secret(what: &str) -> AttemptFailure {
    AttemptFailure {
        error: GatewayError::CredentialInvalid(format!("credential missing {what}")),
        mark: Some(PoolMark::Invalid {
            reason: format!("missing {what}"),
        }),
    }
}

pub(crate) fn strip_model_prefix<'a>(model: &'a str, prefix: &str) -> &'a str {
    model.strip_prefix(prefix).unwrap_or(model)
}
