use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{ApiKeyRegistry, AuthError, authenticate};
use crate::metrics::{ADMITTED_TOTAL, AUTH_REJECTIONS, RATE_LIMITED_TOTAL, REQUEST_TOTAL};
use crate::rate_limit::{Admission, RateLimiter};

#[derive(Clone)]
pub struct GateState {
    pub registry: Arc<ApiKeyRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub health_path: Arc<str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateRejection {
    Unauthorized(AuthError),
    RateLimited { retry_after: Duration },
}

// Rounded up, so waiting this long always frees the slot
fn retry_after_ms(retry_after: Duration) -> u64 {
    u64::try_from(retry_after.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        match self {
            GateRejection::Unauthorized(err) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response(),
            GateRejection::RateLimited { retry_after } => {
                let retry_after_ms = retry_after_ms(retry_after);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "retryAfterMs": retry_after_ms,
                    })),
                )
                    .into_response();

                // Retry-After only carries whole seconds
                let secs = retry_after_ms.div_ceil(1000);
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
        }
    }
}

// Auth, then admission; short-circuits with 401 or 429
pub async fn gatekeeper(
    State(gate): State<GateState>,
    mut req: Request,
    next: Next,
) -> Result<Response, GateRejection> {
    REQUEST_TOTAL.inc();

    let path = req.uri().path().to_owned();
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        // Values that aren't visible ASCII can't be a bearer credential, so
        // they are mapped to a value that fails the format check
        .map(|value| value.to_str().unwrap_or(" "));

    let identity = authenticate(&gate.registry, &gate.health_path, &path, authorization)
        .map_err(|err| {
            AUTH_REJECTIONS.with_label_values(&[err.reason()]).inc();
            tracing::warn!(path = %path, reason = err.reason(), "Rejected unauthenticated request");
            GateRejection::Unauthorized(err)
        })?;

    // Health checks carry no identity and skip rate limiting
    let Some(client) = identity else {
        return Ok(next.run(req).await);
    };

    match gate.rate_limiter.check(&client) {
        Admission::Admitted => {
            ADMITTED_TOTAL.inc();
            tracing::debug!(client = %client, path = %path, "Admitted request");
            req.extensions_mut().insert(client);
            Ok(next.run(req).await)
        }
        Admission::Rejected { retry_after } => {
            RATE_LIMITED_TOTAL.inc();
            tracing::warn!(
                client = %client,
                path = %path,
                retry_after_ms = retry_after_ms(retry_after),
                "Rate limit exceeded"
            );
            Err(GateRejection::RateLimited { retry_after })
        }
    }
}
