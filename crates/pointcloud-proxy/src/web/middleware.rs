//! HTTP middleware

use axum::{
    extract::Request,
    http::{Method, Uri},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{debug, warn};

/// Request logging middleware
///
/// Successful requests are logged at debug level; tile file requests are
/// numerous and would drown everything else.
pub async fn request_logging_middleware(
    method: Method,
    uri: Uri,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration = start.elapsed();

    if status >= 400 && status != 404 {
        warn!(
            method = %method,
            uri = %uri,
            status = status,
            duration_ms = duration.as_millis(),
            "HTTP request completed with error"
        );
    } else {
        debug!(
            method = %method,
            uri = %uri,
            status = status,
            duration_ms = duration.as_millis(),
            "HTTP request completed"
        );
    }

    response
}
