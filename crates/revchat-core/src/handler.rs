use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use revchat_protocol::openai::{ChatCompletionRequest, ChatCompletionResponse, ModelList};
use revchat_provider_core::{CallContext, ChatRequest};

use crate::core::CoreState;
use crate::error::{error_response, gateway_error_response};
use crate::stream::{collect_content, encode_sse};

pub async fn chat_completions(State(state): State<Arc<CoreState>>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
                "invalid_request_error",
            );
        }
    };
    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "messages must not be empty",
            "invalid_request_error",
        );
    }
    let Some(provider) = (state.lookup)(&request.model) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("unsupported model: {}", request.model),
            "model_not_found",
        );
    };

    let trace_id = Uuid::new_v4().to_string();
    info!(
        event = "chat_request",
        trace_id = %trace_id,
        backend = provider.name(),
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len()
    );

    let ctx = CallContext::new(trace_id);
    let chat = ChatRequest {
        model: request.model.clone(),
        messages: request.messages,
    };
    let events = provider.chat(chat, ctx);

    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = OffsetDateTime::now_utc().unix_timestamp();

    if request.stream {
        let body = Body::from_stream(encode_sse(events, id, created, request.model));
        let mut resp = Response::new(body);
        let headers = resp.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        // Proxies like nginx buffer streams unless told otherwise.
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        resp
    } else {
        match collect_content(events).await {
            Ok(content) => {
                let response =
                    ChatCompletionResponse::assistant(id, created, request.model, content);
                json_response(StatusCode::OK, &response)
            }
            Err(err) => gateway_error_response(&err),
        }
    }
}

pub async fn list_models(State(state): State<Arc<CoreState>>) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let mut data = Vec::new();
    for provider in &state.providers {
        let ctx = CallContext::new(trace_id.clone());
        match provider.list_models(ctx).await {
            Ok(models) => {
                info!(
                    event = "models_listed",
                    trace_id = %trace_id,
                    backend = provider.name(),
                    models = models.len()
                );
                data.extend(models);
            }
            Err(err) => {
                // One unreachable catalog should not empty the whole list.
                error!(
                    event = "models_list_failed",
                    trace_id = %trace_id,
                    backend = provider.name(),
                    error = %err
                );
            }
        }
    }
    json_response(StatusCode::OK, &ModelList::new(data))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &err.to_string(),
            "internal_error",
        ),
    }
}
