use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Instant;

use crate::auth::ClientIdentity;
use crate::metrics::UPSTREAM_LATENCY;
use crate::state::AppState;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

// Connection-scoped headers plus the ones reqwest/hyper recompute themselves
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug)]
pub enum ProxyError {
    NoHealthyBackend,
    // to_bytes fails both on the size cap and on a broken client body
    BodyTooLarge,
    Upstream,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ProxyError::NoHealthyBackend => {
                (StatusCode::SERVICE_UNAVAILABLE, "No healthy backends available")
            }
            ProxyError::BodyTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
            ProxyError::Upstream => (StatusCode::BAD_GATEWAY, "Upstream request failed"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

// The backend sees who the caller is, never the caller's key
fn upstream_headers(headers: &HeaderMap, client: Option<&ClientIdentity>) -> HeaderMap {
    let mut forwarded = forwardable(headers);
    forwarded.remove(header::AUTHORIZATION);
    forwarded.remove(CLIENT_ID_HEADER);

    if let Some(client) = client {
        match HeaderValue::from_str(client.as_str()) {
            Ok(value) => {
                forwarded.insert(CLIENT_ID_HEADER, value);
            }
            Err(_) => {
                tracing::warn!(client = %client, "Client identity is not a valid header value");
            }
        }
    }
    forwarded
}

// Forwards an admitted request to the next healthy backend
pub async fn proxy_handler(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();
    let client = parts.extensions.get::<ClientIdentity>();

    let backend = state
        .load_balancer
        .get_backend()
        .ok_or(ProxyError::NoHealthyBackend)?;

    let body = to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| ProxyError::BodyTooLarge)?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let url = format!("{}{}", backend.url, path_and_query);

    let start_time = Instant::now();
    let result = state
        .client
        .request(parts.method.clone(), &url)
        .headers(upstream_headers(&parts.headers, client))
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(res) => res,
        Err(e) => {
            // Marking backend as unhealthy until the health checker sees it again
            backend.set_healthy(false);
            tracing::warn!(url = %backend.url, error = %e, "Backend request failed, marked unhealthy");
            return Err(ProxyError::Upstream);
        }
    };

    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| {
        tracing::warn!(url = %backend.url, error = %e, "Failed to read backend response");
        ProxyError::Upstream
    })?;

    UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());
    tracing::debug!(
        method = %parts.method,
        url = %url,
        status = status.as_u16(),
        "Forwarded request"
    );

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
