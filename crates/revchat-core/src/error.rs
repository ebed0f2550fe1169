use axum::body::Body;
use axum::response::Response;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use serde_json::json;

use revchat_provider_core::GatewayError;

pub fn error_body(message: &str, error_type: &str) -> String {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": error_type,
        }
    })
    .to_string()
}

pub fn error_response(status: StatusCode, message: &str, error_type: &str) -> Response {
    let mut resp = Response::new(Body::from(error_body(message, error_type)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub fn error_type_for(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::NoCredentials(_) => "no_credentials_available",
        GatewayError::CredentialInvalid(_) => "credential_invalid",
        GatewayError::RateLimited(_) => "rate_limited",
        GatewayError::TransportChallenge => "transport_challenge",
        GatewayError::Connection(_) => "connection_error",
        GatewayError::Protocol(_) => "upstream_protocol_error",
    }
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NoCredentials(_) | GatewayError::TransportChallenge => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::CredentialInvalid(_)
        | GatewayError::Connection(_)
        | GatewayError::Protocol(_) => StatusCode::BAD_GATEWAY,
    }
}

pub fn gateway_error_response(err: &GatewayError) -> Response {
    error_response(status_for(err), &err.to_string(), error_type_for(err))
}
