use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::error;

use crate::config::Config;
use crate::nvme::error::NvmeError;
use crate::scraper::CancelFlag;
use crate::scraper::NvmeScraper;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const INDEX_BODY: &str = "ec2-nvme-exporter\n\nmetrics: /metrics\nhealth:  /health\n";

/// HTTP pull surface. Each GET of /metrics drives exactly one scrape cycle on
/// a blocking worker; the exporter holds no background collection loop.
pub struct MetricsServer {
    config: Config,
    scraper: Arc<NvmeScraper>,
    cancel: CancelFlag,
}

#[derive(Clone)]
struct ScrapeState {
    scraper: Arc<NvmeScraper>,
    cancel: CancelFlag,
}

impl MetricsServer {
    pub fn new(config: Config, scraper: NvmeScraper) -> Self {
        Self {
            config,
            scraper: Arc::new(scraper),
            cancel: CancelFlag::new(),
        }
    }

    pub async fn serve(self) -> Result<(), NvmeError> {
        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|source| NvmeError::io_context("bind listen socket", source))?;

        let state = ScrapeState {
            scraper: self.scraper,
            cancel: self.cancel,
        };
        let router = Router::new()
            .route("/", get(|| async { INDEX_BODY }))
            .route("/health", get(|| async { "up" }))
            .route("/metrics", get(scrape_handler))
            .with_state(state.clone());

        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(state.cancel))
            .await
            .map_err(|source| NvmeError::io_context("http server", source))
    }
}

async fn scrape_handler(State(state): State<ScrapeState>) -> Response {
    let ScrapeState { scraper, cancel } = state;
    let joined = tokio::task::spawn_blocking(move || scraper.scrape(&cancel)).await;

    let scraped = match joined {
        Ok(result) => result,
        Err(join_error) => Err(NvmeError::Internal(format!(
            "scrape worker died: {}",
            join_error
        ))),
    };

    match scraped {
        Ok(body) => ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(error) => {
            error!(error = %error, "scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("scrape failed: {}\n", error),
            )
                .into_response()
        }
    }
}

/// Waits for a shutdown signal, then trips the cancel flag so an in-flight
/// cycle stops at its next cancellation point before the listener closes.
async fn wait_for_shutdown(cancel: CancelFlag) {
    shutdown_requested().await;
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_requested() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(error = %error, "SIGTERM handler unavailable, watching ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_requested() {
    let _ = tokio::signal::ctrl_c().await;
}
