use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use vbus_common::metrics;

use super::index;
use crate::context::AppContext;

pub fn app(context: AppContext, metrics: Option<PrometheusHandle>) -> Router {
    let liveness = context.liveness.clone();

    Router::new()
        .route("/", routing::get(index::get))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use health::HealthRegistry;
    use http_body_util::BodyExt; // for `collect`
    use std::sync::Arc;
    use time::OffsetDateTime;
    use tower::ServiceExt; // for `oneshot`
    use vbus_common::consolidator::{ConsolidatorOptions, HeaderSetConsolidator};
    use vbus_common::header::Header;
    use vbus_common::specification::TableSpecification;

    fn context() -> AppContext {
        AppContext::new(
            Arc::new(TableSpecification::default_specification().unwrap()),
            HeaderSetConsolidator::new(ConsolidatorOptions::default()),
            HealthRegistry::new("liveness"),
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_serves_empty_array() {
        let app = app(context(), None);

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn index_reports_decoding_errors_as_text() {
        let context = context();
        context.consolidator.add_header(Header {
            channel: 0,
            destination_address: 0x0010,
            source_address: 0x4278,
            protocol_version: 0x10,
            command: 0x0100,
            timestamp: OffsetDateTime::now_utc(),
            frame_data: vec![0; 2],
        });
        let app = app(context, None);

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("00_0010_4278_10_0100_002_2_0"));
    }

    #[tokio::test]
    async fn metrics_without_recorder() {
        let app = app(context(), None);

        let response = app.oneshot(get("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"no metrics recorder installed");
    }

    #[tokio::test]
    async fn liveness_follows_registry() {
        let context = context();
        let app = app(context.clone(), None);

        let response = app.clone().oneshot(get("/_liveness")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        context
            .liveness
            .register("ingest", time::Duration::seconds(30))
            .report_healthy();
        let response = app.oneshot(get("/_liveness")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
