//! The HTTP side of a stage process: Prometheus metrics, liveness, and readiness.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const HTTP_REQUESTS: &str = "pipeline_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "pipeline_http_request_duration_seconds";

/// Whether the stage holds its broker connections. Starts out not ready.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct StageState {
    stage: Arc<str>,
    readiness: Readiness,
    recorder: PrometheusHandle,
}

/// Bind a `TcpListener` on `bind` and serve `router` on it until the process exits.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder and build the router for `stage`.
pub fn setup_stage_router(stage: &str, readiness: Readiness) -> Result<Router, BuildError> {
    let recorder = setup_metrics_recorder()?;
    Ok(stage_router(stage, readiness, recorder))
}

pub fn stage_router(stage: &str, readiness: Readiness, recorder: PrometheusHandle) -> Router {
    let stage: Arc<str> = Arc::from(stage);
    let state = StageState {
        stage: stage.clone(),
        readiness,
        recorder,
    };

    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| std::future::ready("ok")))
        .route("/_readiness", get(report_readiness))
        .route("/metrics", get(render_metrics))
        .layer(axum::middleware::from_fn_with_state(stage, track_requests))
        .with_state(state)
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Handler durations range from a few ms to minutes for summarization.
    const HANDLER_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(HANDLER_SECONDS)?
        .install_recorder()
}

async fn index(State(state): State<StageState>) -> String {
    format!("pipeline stage {}", state.stage)
}

async fn report_readiness(State(state): State<StageState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn render_metrics(State(state): State<StageState>) -> String {
    state.recorder.render()
}

/// Count and time every request by stage and route. Unrouted paths share one label value.
async fn track_requests(
    State(stage): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("stage", stage.to_string()),
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}
