use crate::config::ProxyConfig;
use crate::domains::AuthType;
use crate::error::ProxyError;
use crate::logging::SharedLogger;
use crate::middleware as mw;
use crate::middleware::{json_error, PathGuard, RateLimiter};
use crate::persist::QueueHandle;
use crate::proxy::{self, CaptureContext};

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Per-request total timeout on the fixed OpenAI-style entry points.
const FIXED_ENTRY_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AppState {
    pub config: ProxyConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
    pub queue: QueueHandle,
    pub rate_limiter: RateLimiter,
    pub path_guard: PathGuard,
}

impl AppState {
    pub fn new(
        config: ProxyConfig,
        client: reqwest::Client,
        logger: SharedLogger,
        queue: QueueHandle,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.security.rate, config.security.burst);
        let path_guard = PathGuard::new(&config.security.suspicious_patterns);
        Self {
            config,
            client,
            logger,
            queue,
            rate_limiter,
            path_guard,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_fixed))
        .route("/v1/completions", post(handle_fixed))
        .route("/v1/embeddings", post(handle_fixed))
        .route("/:domain/*path", get(handle_dynamic).post(handle_dynamic))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mw::probe_filter,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mw::body_size_guard,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), mw::rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), mw::path_guard))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mw::host_method_guard,
        ))
        .layer(middleware::from_fn(mw::security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not Found")
}

async fn handle_health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dynamic-proxy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// Dynamic proxy: `/{domain}/{path…}` where `domain` must be allow-listed.
async fn handle_dynamic(
    State(state): State<Arc<AppState>>,
    Path((domain, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(rule) = state.config.allowed_domains.get(&domain).cloned() else {
        state
            .logger
            .warn("proxy", format!("Rejected domain not in allow list: {domain}"));
        return json_error(
            StatusCode::FORBIDDEN,
            format!("Domain {domain} is not in the allow list"),
        );
    };

    let path = format!("/{path}");
    let path_and_query = match query {
        Some(ref q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.clone(),
    };
    let url = rule.target_url(&domain, &path_and_query);
    let auth_type = rule.resolve_auth_type(&path);
    let forward = proxy::forward_headers(&headers);

    if method == Method::GET {
        // No prompt to capture on a GET; plain pass-through
        let response = match proxy::send_with_retry(
            &state.client,
            reqwest::Method::GET,
            &url,
            forward,
            None,
            None,
            &state.logger,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => return upstream_exhausted(&state, &e),
        };
        return forward_complete(&state, response).await;
    }

    let body_json: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            state
                .logger
                .error("proxy", format!("Invalid request JSON: {e}"));
            return json_error(StatusCode::BAD_REQUEST, "Invalid JSON in request body");
        }
    };

    if proxy::prompt_char_count(&body_json) > proxy::MAX_PROMPT_CHARS {
        state.logger.warn("proxy", "Request body over prompt character limit");
        return json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large; reduce the input or split the request",
        );
    }

    let is_stream = proxy::wants_stream(&body_json, &path);
    let model = body_json
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    state.logger.info(
        "proxy",
        format!("{domain}{path} auth={auth_type:?} stream={is_stream} model={model}"),
    );

    let response = match proxy::send_with_retry(
        &state.client,
        reqwest::Method::POST,
        &url,
        forward,
        Some(body),
        None,
        &state.logger,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => return upstream_exhausted(&state, &e),
    };

    let capture = CaptureContext {
        auth_type,
        model,
        request_body: body_json,
        queue: state.queue.clone(),
        logger: state.logger.clone(),
    };
    respond_with_capture(&state, response, is_stream, capture).await
}

/// Fixed OpenAI-style entry points, retargeted to the configured default
/// upstream. Requires a bearer token; when the upstream speaks Gemini the
/// chat body is rewritten to `contents[].parts[].text` form.
async fn handle_fixed(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !bearer.starts_with("Bearer ") {
        return json_error(StatusCode::UNAUTHORIZED, "Missing bearer token");
    }

    let body_json: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            state
                .logger
                .error("proxy", format!("Invalid request JSON: {e}"));
            return json_error(StatusCode::BAD_REQUEST, "Invalid JSON in request body");
        }
    };

    if proxy::prompt_char_count(&body_json) > proxy::MAX_PROMPT_CHARS {
        return json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large; reduce the input or split the request",
        );
    }

    let domain = state.config.default_upstream.clone();
    let Some(rule) = state.config.allowed_domains.get(&domain).cloned() else {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Default upstream is not allow-listed",
        );
    };

    let original_path = uri.path().to_string();
    let auth_type = rule.resolve_auth_type(&original_path);
    let requested_stream = proxy::wants_stream(&body_json, &original_path);
    let model = body_json
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let (forward_body, target_path) =
        if auth_type == AuthType::Google && original_path == "/v1/chat/completions" {
            let rewritten = auth_type.rewrite_request(&body_json);
            let verb = if requested_stream {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            let mut target = format!("/v1beta/models/{model}:{verb}");
            if requested_stream {
                target.push_str("?alt=sse");
            }
            (rewritten, target)
        } else {
            (body_json.clone(), original_path.clone())
        };

    let url = rule.target_url(&domain, &target_path);
    let bytes = match serde_json::to_vec(&forward_body) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            state
                .logger
                .error("proxy", format!("Failed to serialize forwarded body: {e}"));
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    state.logger.info(
        "proxy",
        format!("{original_path} -> {url} stream={requested_stream} model={model}"),
    );

    let response = match proxy::send_with_retry(
        &state.client,
        reqwest::Method::POST,
        &url,
        proxy::forward_headers(&headers),
        Some(bytes),
        Some(FIXED_ENTRY_TIMEOUT),
        &state.logger,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => return upstream_exhausted(&state, &e),
    };

    let capture = CaptureContext {
        auth_type,
        model,
        request_body: forward_body,
        queue: state.queue.clone(),
        logger: state.logger.clone(),
    };
    respond_with_capture(&state, response, requested_stream, capture).await
}

fn upstream_exhausted(state: &AppState, err: &ProxyError) -> Response {
    state
        .logger
        .error("proxy", format!("Upstream attempts exhausted: {err}"));
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Upstream request failed")
}

/// Relay the upstream response. Error statuses forward verbatim; streams
/// tee into the capture pipeline; complete bodies forward and then parse
/// off the request path.
async fn respond_with_capture(
    state: &AppState,
    response: reqwest::Response,
    requested_stream: bool,
    capture: CaptureContext,
) -> Response {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.as_u16() >= 400 {
        let body_text = response.text().await.unwrap_or_default();
        state.logger.warn(
            "proxy",
            format!("Upstream returned {}: {}", status, truncate(&body_text, 300)),
        );
        return verbatim_response(status, body_text, "application/json");
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let is_stream = requested_stream || content_type.contains("text/event-stream");

    if is_stream {
        let body = proxy::capture_stream(response, capture);
        let content_type = if content_type.is_empty() {
            "text/event-stream".to_string()
        } else {
            content_type
        };
        return Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let body_text = match response.text().await {
        Ok(t) => t,
        Err(e) => {
            state
                .logger
                .error("proxy", format!("Failed to read upstream body: {e}"));
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Upstream read failed");
        }
    };

    // Parse and persist after the response contract is honored
    let captured_text = body_text.clone();
    tokio::spawn(async move {
        proxy::capture_complete(captured_text, capture);
    });

    verbatim_response(status, body_text, "application/json")
}

/// Plain pass-through for requests with nothing to capture (GET).
async fn forward_complete(state: &AppState, response: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.as_u16() >= 400 {
        let body_text = response.text().await.unwrap_or_default();
        state.logger.warn(
            "proxy",
            format!("Upstream returned {}: {}", status, truncate(&body_text, 300)),
        );
        return verbatim_response(status, body_text, "application/json");
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    match response.bytes().await {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            state
                .logger
                .error("proxy", format!("Failed to read upstream body: {e}"));
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Upstream read failed")
        }
    }
}

fn verbatim_response(status: StatusCode, body: String, content_type: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
