//! Downstream HTTP boundary.
//!
//! Downstream bots speak the ordinary Bot API against this listener, with the
//! configured downstream token in place of the real one. Requests are proxied
//! upstream mostly verbatim; the exceptions are `getUpdates`, which is served
//! from the local update log, send throttling, and the echo tee on successful
//! send/edit responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{request::Parts, HeaderMap, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use tbmux_store::UpdateStore;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::cooldown::CooldownTracker;
use crate::echo::{echo_kind_for_method, EchoKind, EchoProcessor};

/// Upstream caps uploads at 50 MB; anything bigger is rejected before
/// buffering.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

const DEFAULT_CONSUMER: &str = "default";
const MAX_FETCH_LIMIT: usize = 100;
const MAX_POLL_TIMEOUT_SECS: u64 = 3600;

/// Downstream listener and forwarding configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Downstream path prefix for API methods.
    pub api_path: String,
    /// Downstream path prefix for raw file fetches.
    pub file_path: String,
    /// Shared token downstream clients must present; compared byte-for-byte.
    pub downstream_token: String,
    /// Upstream API prefix ending in the path-escaped real token.
    pub upstream_api_prefix: String,
    /// Upstream file prefix ending in the path-escaped real token.
    pub upstream_file_prefix: String,
}

/// Shared state behind the downstream router.
pub struct ProxyState {
    http: reqwest::Client,
    store: Arc<UpdateStore>,
    cooldowns: Arc<CooldownTracker>,
    echo: EchoProcessor,
    config: ServerConfig,
}

impl ProxyState {
    pub fn new(
        config: ServerConfig,
        store: Arc<UpdateStore>,
        cooldowns: Arc<CooldownTracker>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::USER_AGENT,
            axum::http::HeaderValue::from_static(crate::USER_AGENT),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create upstream forwarding client")?;
        let echo = EchoProcessor::new(Arc::clone(&store), Arc::clone(&cooldowns));

        Ok(Self {
            http,
            store,
            cooldowns,
            echo,
            config,
        })
    }
}

/// Binds the downstream listener and serves until ctrl-c.
pub async fn run_server(state: Arc<ProxyState>) -> Result<()> {
    let bind_addr: SocketAddr = state
        .config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid downstream.listen_addr '{}'", state.config.listen_addr))?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind downstream listener on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve downstream listen address")?;
    info!(
        "downstream listener ready: addr={} api_path={} file_path={}",
        local_addr, state.config.api_path, state.config.file_path,
    );

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("downstream server exited unexpectedly")?;
    Ok(())
}

/// Route prefixes come from configuration and may span several path
/// segments, so the router is a single fallback that matches them itself.
pub(crate) fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(handle_downstream)
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteFamily {
    Api,
    File,
}

#[derive(Debug, PartialEq, Eq)]
struct RouteMatch {
    family: RouteFamily,
    token: String,
    /// API method name, or the file path remainder for the file family.
    suffix: String,
}

/// Splits `path` as `{prefix}[/]{token}/{suffix}`. The token may share a
/// segment with the prefix (`/bot<token>/m`, the upstream URL shape) or sit
/// in its own segment (`/bot/<token>/m`).
fn split_route(path: &str, prefix: &str, family: RouteFamily) -> Option<RouteMatch> {
    let rest = path.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let (token, suffix) = rest.split_once('/')?;
    if token.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(RouteMatch {
        family,
        token: percent_encoding::percent_decode_str(token)
            .decode_utf8_lossy()
            .into_owned(),
        suffix: suffix.to_string(),
    })
}

fn classify_route(path: &str, api_path: &str, file_path: &str) -> Option<RouteMatch> {
    let api = split_route(path, api_path, RouteFamily::Api);
    let file = split_route(path, file_path, RouteFamily::File);
    match (api, file) {
        // The default prefixes nest ("/bot" and "/file/bot"); when both
        // match, the longer prefix is the intended family.
        (Some(api), Some(file)) => Some(if file_path.len() >= api_path.len() {
            file
        } else {
            api
        }),
        (api, file) => api.or(file),
    }
}

/// Looks a request parameter up the way Bot API clients send them: in the
/// query string, an urlencoded form body, or a JSON object body.
fn request_param(uri: &Uri, headers: &HeaderMap, body: &[u8], key: &str) -> Option<String> {
    if let Some(query) = uri.query() {
        if let Some((_, value)) =
            form_urlencoded::parse(query.as_bytes()).find(|(name, _)| name.as_ref() == key)
        {
            return Some(value.into_owned());
        }
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        return form_urlencoded::parse(body)
            .find(|(name, _)| name.as_ref() == key)
            .map(|(_, value)| value.into_owned());
    }
    if content_type.starts_with("application/json") {
        let payload: Value = serde_json::from_slice(body).ok()?;
        return match payload.get(key)? {
            Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        };
    }
    None
}

fn bot_api_error(status: StatusCode, description: &str) -> Response {
    (
        status,
        Json(json!({
            "ok": false,
            "error_code": status.as_u16(),
            "description": description,
        })),
    )
        .into_response()
}

async fn handle_downstream(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let Some(route) = classify_route(
        parts.uri.path(),
        &state.config.api_path,
        &state.config.file_path,
    ) else {
        return bot_api_error(StatusCode::NOT_FOUND, "Not Found");
    };
    if route.token != state.config.downstream_token {
        return bot_api_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(error) => {
            warn!("failed to read downstream request body: {error:#}");
            return bot_api_error(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    match route.family {
        RouteFamily::Api if route.suffix == "getUpdates" => {
            handle_get_updates(&state, &parts, &body).await
        }
        RouteFamily::Api => forward_request(&state, parts, body, &route.suffix, false).await,
        RouteFamily::File => forward_request(&state, parts, body, &route.suffix, true).await,
    }
}

/// Serves `getUpdates` from the local log instead of proxying it: the proxy
/// owns the sole upstream long-poll session, and every downstream consumer
/// reads the shared log through its own cursor.
async fn handle_get_updates(state: &Arc<ProxyState>, parts: &Parts, body: &Bytes) -> Response {
    let consumer = request_param(&parts.uri, &parts.headers, body, "consumer")
        .unwrap_or_else(|| DEFAULT_CONSUMER.to_string());
    let offset = request_param(&parts.uri, &parts.headers, body, "offset")
        .and_then(|value| value.parse::<i64>().ok());
    let limit = request_param(&parts.uri, &parts.headers, body, "limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(MAX_FETCH_LIMIT)
        .clamp(1, MAX_FETCH_LIMIT);
    let timeout = request_param(&parts.uri, &parts.headers, body, "timeout")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
        .min(MAX_POLL_TIMEOUT_SECS);

    // A positive offset acknowledges everything below it.
    if let Some(offset) = offset.filter(|offset| *offset > 0) {
        if let Err(error) = state.store.advance_cursor(&consumer, offset as u64) {
            warn!("failed to advance cursor of consumer '{consumer}': {error}");
            return bot_api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    }

    let updates = match state
        .store
        .fetch_updates(&consumer, limit, Duration::from_secs(timeout))
        .await
    {
        Ok(updates) => updates,
        Err(error) => {
            warn!("failed to fetch updates for consumer '{consumer}': {error}");
            return bot_api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let result: Vec<Value> = updates
        .into_iter()
        .map(|update| {
            let mut entry = serde_json::Map::new();
            entry.insert("update_id".to_string(), json!(update.local_id));
            entry.insert(update.kind, update.payload);
            Value::Object(entry)
        })
        .collect();
    (StatusCode::OK, Json(json!({"ok": true, "result": result}))).into_response()
}

/// Hop-by-hop and identity headers are not forwarded upstream; the proxy
/// speaks for itself (`User-Agent`) and terminates its own connection
/// semantics.
fn should_forward_request_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "accept-encoding"
            | "content-encoding"
            | "connection"
            | "host"
            | "proxy-connection"
            | "user-agent"
            | "content-length"
            | "transfer-encoding"
    )
}

fn should_forward_response_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "accept-encoding" | "content-encoding" | "connection" | "proxy-connection"
            | "transfer-encoding"
    )
}

async fn forward_request(
    state: &Arc<ProxyState>,
    parts: Parts,
    body: Bytes,
    suffix: &str,
    is_file: bool,
) -> Response {
    if !is_file {
        if let Some(chat_id) = request_param(&parts.uri, &parts.headers, &body, "chat_id")
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|chat_id| *chat_id != 0)
        {
            state.cooldowns.wait_for_send(chat_id).await;
        }
    }

    let prefix = if is_file {
        &state.config.upstream_file_prefix
    } else {
        &state.config.upstream_api_prefix
    };
    let upstream_url = match parts.uri.query() {
        Some(query) => format!("{prefix}/{suffix}?{query}"),
        None => format!("{prefix}/{suffix}"),
    };
    debug!("{} {}", parts.method, upstream_url);

    let mut upstream_request = state.http.request(parts.method.clone(), &upstream_url);
    for (name, value) in &parts.headers {
        if should_forward_request_header(name) {
            upstream_request = upstream_request.header(name, value);
        }
    }

    let upstream_response = match upstream_request.body(body).send().await {
        Ok(response) => response,
        Err(error) => {
            warn!("upstream request for {suffix} failed: {error:#}");
            return bot_api_error(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();

    let echo_kind = if is_file {
        None
    } else {
        echo_kind_for_method(suffix)
    };
    let body = match (echo_kind, status.is_success()) {
        (Some(kind), true) => buffer_and_echo(state, kind, suffix, upstream_response).await,
        _ => Body::from_stream(upstream_response.bytes_stream()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    for (name, value) in &upstream_headers {
        if should_forward_response_header(name) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

/// Buffers an echo-capable 2xx response so the synthetic update is committed
/// before the downstream client sees the body. Bot API responses are small;
/// only file fetches (never echoed) carry bulk payloads.
async fn buffer_and_echo(
    state: &Arc<ProxyState>,
    kind: EchoKind,
    suffix: &str,
    upstream_response: reqwest::Response,
) -> Body {
    match upstream_response.bytes().await {
        Ok(body) => {
            state.echo.process(kind, &body);
            Body::from(body)
        }
        Err(error) => {
            warn!("failed to read upstream response for {suffix}: {error:#}");
            Body::empty()
        }
    }
}
