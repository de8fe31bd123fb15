//! JSON status surface for the polling engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobpoll_core::PollingStats;
use jobpoll_sync::PollingEngine;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CRATE_NAME: &str = "jobpoll-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PollingEngine>,
}

impl AppState {
    pub fn new(engine: Arc<PollingEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct SourceRow {
    source_id: String,
    display_name: String,
    url: String,
    parser: &'static str,
    min_poll_minutes: u32,
    max_poll_minutes: u32,
    stats: PollingStats,
}

#[derive(Debug, Serialize)]
struct SourcesBody {
    durable: bool,
    sources: Vec<SourceRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/{source_id}/stats", get(source_stats_handler))
        .with_state(Arc::new(state))
}

/// Serve on `port` until `shutdown` fires.
pub async fn serve(engine: Arc<PollingEngine>, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status server listening");
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: "jobpoll",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Json<SourcesBody> {
    let engine = &state.engine;
    let sources = engine
        .all_stats()
        .await
        .into_iter()
        .map(|(source, stats)| SourceRow {
            source_id: source.config.source_id.clone(),
            display_name: source.config.display_name.clone(),
            url: source.config.url.clone(),
            parser: source.parser_kind(),
            min_poll_minutes: source.target.bounds.min_minutes,
            max_poll_minutes: source.target.bounds.max_minutes,
            stats,
        })
        .collect();
    Json(SourcesBody {
        durable: engine.repository().is_durable(),
        sources,
    })
}

async fn source_stats_handler(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Response {
    match state.engine.stats(&source_id).await {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown source", "source_id": source_id })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use jobpoll_sources::{HtmlParserConfig, ParserConfig, SourceConfig, SourceRegistry};
    use jobpoll_sync::{MetadataRepository, SyncConfig};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let registry = SourceRegistry {
            sources: vec![SourceConfig {
                source_id: "campus-board".into(),
                display_name: "Campus Board".into(),
                url: "http://127.0.0.1:9/jobs".into(),
                enabled: true,
                min_poll_minutes: Some(10),
                max_poll_minutes: None,
                max_listing_age_days: None,
                parser: ParserConfig::Html(HtmlParserConfig {
                    item_selector: "li.job".into(),
                    title_selector: "h3".into(),
                    link_selector: "a[href]".into(),
                    company_selector: None,
                    company_name: Some("Campus".into()),
                    location_selector: None,
                    base_url: None,
                }),
                notes: None,
            }],
        };
        let engine = PollingEngine::new(
            &SyncConfig::default(),
            &registry,
            Arc::new(MetadataRepository::in_memory()),
        )
        .unwrap();
        app(AppState::new(Arc::new(engine)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_service_and_version() {
        let (status, body) = get_json(test_app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "jobpoll");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn sources_lists_registry_with_fresh_stats() {
        let (status, body) = get_json(test_app(), "/sources").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["durable"], false);
        let row = &body["sources"][0];
        assert_eq!(row["source_id"], "campus-board");
        assert_eq!(row["parser"], "html");
        assert_eq!(row["min_poll_minutes"], 10);
        assert_eq!(row["stats"]["total_polls"], 0);
        assert_eq!(row["stats"]["current_poll_interval_minutes"], 30);
    }

    #[tokio::test]
    async fn source_stats_returns_snapshot_or_404() {
        let app = test_app();
        let (status, body) = get_json(app.clone(), "/sources/campus-board/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source_name"], "Campus Board");
        assert_eq!(body["change_rate"], 0.0);
        assert!(body["last_poll_at"].is_null());

        let (status, body) = get_json(app, "/sources/nope/stats").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["source_id"], "nope");
    }
}
