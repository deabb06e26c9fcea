//! HTTP metrics middleware.
//!
//! Applied as the outermost layer so framework-level rejections (404, 405,
//! 415, request timeouts) are counted alongside handler responses.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and duration of every response.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use metrics_util::debugging::DebuggingRecorder;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "OK"
    }

    #[tokio::test]
    async fn test_unknown_route_is_recorded_as_other() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let app = Router::new()
            .route("/health", get(ok_handler))
            .layer(middleware::from_fn(http_metrics_middleware));

        let _guard = metrics::set_default_local_recorder(&recorder);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let recorded = snapshotter.snapshot().into_vec();
        let endpoint_labels: Vec<String> = recorded
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "relay_http_requests_total")
            .flat_map(|(key, _, _, _)| {
                key.key()
                    .labels()
                    .filter(|l| l.key() == "endpoint")
                    .map(|l| l.value().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(endpoint_labels, vec!["other".to_string()]);
    }
}
