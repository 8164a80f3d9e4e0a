//! HTTP surface: probe endpoint, landing page, exporter metrics, health.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::config::ConfigStore;
use crate::metrics::{EXPOSITION_CONTENT_TYPE, NAMESPACE, ProcessMetrics, probe_registry, render_registry};
use crate::runner::{RunResult, build_command, run};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<ConfigStore>,
    metrics: Arc<ProcessMetrics>,
}

/// Create the HTTP router. Basic auth is layered on every route when both
/// credentials are configured.
fn create_router(config: Arc<ConfigStore>, metrics: Arc<ProcessMetrics>) -> Router {
    let auth_enabled =
        config.server.auth_user.is_some() && config.server.auth_password.is_some();

    let state = AppState { config, metrics };

    let router = Router::new()
        .route("/", get(landing_handler))
        .route("/metrics", get(exporter_metrics_handler))
        .route("/probe", get(probe_handler))
        .route("/health", get(health_handler));

    let router = if auth_enabled {
        router.layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ))
    } else {
        router
    };

    router.layer(CorsLayer::permissive()).with_state(state)
}

/// Handler for the /probe endpoint.
///
/// A failing probe command is data, not an error: the response is still a
/// 200 whose gauges (or debug table) carry the failure. Only an unknown
/// module name is a request error.
async fn probe_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let module = params.get("module").cloned().unwrap_or_default();

    debug!(%module, "retrieve probe");

    let Some(probe) = state.config.probe(&module) else {
        debug!(%module, "invalid probe");
        return (StatusCode::NOT_FOUND, "Invalid Probe").into_response();
    };

    let args = build_command(probe, &params);
    let result = run(&probe.command, &args).await;

    state.metrics.record_run(&module, result.success());

    if params.contains_key("debug") {
        return debug_page(&module, &result).into_response();
    }

    let registry = probe_registry(NAMESPACE, probe, &result);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        render_registry(&registry),
    )
        .into_response()
}

/// Handler for the landing page listing all configured probes.
async fn landing_handler(State(state): State<AppState>) -> Html<String> {
    let title = "Probe Script Exporter";

    let mut names: Vec<&String> = state.config.probes.keys().collect();
    names.sort();

    let mut probe_links = String::new();
    for name in names {
        probe_links.push_str(&format!(
            "<p><a href=\"probe?module={name}\">Probe {name}</a>\
             &nbsp;&nbsp;<a href=\"probe?module={name}&debug\">debug</a></p>\n"
        ));
    }

    Html(format!(
        "<html>\n\
         <head><title>{title}</title></head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <p><a href=\"metrics\">Metrics</a></p>\n\
         {probe_links}\
         </body>\n\
         </html>"
    ))
}

/// Handler for the exporter's own /metrics endpoint.
async fn exporter_metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Reject requests without matching basic-auth credentials.
async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // Only layered when both are configured.
    let (Some(user), Some(password)) = (
        state.config.server.auth_user.as_deref(),
        state.config.server.auth_password.as_deref(),
    ) else {
        return next.run(request).await;
    };

    let expected = format!("Basic {}", BASE64.encode(format!("{user}:{password}")));

    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if supplied != Some(expected.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
            "Unauthorized",
        )
            .into_response();
    }

    next.run(request).await
}

/// Render the human-readable debug table for one probe result.
///
/// Unlike the gauges, this view echoes captured stdout and stderr. Both are
/// HTML-escaped before embedding.
fn debug_page(module: &str, result: &RunResult) -> Html<String> {
    let title = format!("Debug Probe {module}");

    Html(format!(
        "<html>\n\
         <head><title>{title}</title></head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <table cellspacing=\"0\" cellpadding=\"5\">\n\
         <tr><td>success</td><td>{success}</td></tr>\n\
         <tr><td>exit&nbsp;code</td><td>{exit_code}</td></tr>\n\
         <tr><td>duration</td><td>{duration:.6} seconds</td></tr>\n\
         <tr><td valign=\"top\">stdout</td>\
         <td><textarea rows=\"20\" cols=\"120\">{stdout}</textarea></td></tr>\n\
         <tr><td valign=\"top\">stderr</td>\
         <td><textarea rows=\"20\" cols=\"120\">{stderr}</textarea></td></tr>\n\
         </table>\n\
         </body>\n\
         </html>",
        success = result.success(),
        exit_code = result.exit_code,
        duration = result.duration.as_secs_f64(),
        stdout = escape_html(&result.stdout),
        stderr = escape_html(&result.stderr),
    ))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// The exporter's HTTP server.
pub struct HttpServer {
    config: Arc<ConfigStore>,
    metrics: Arc<ProcessMetrics>,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(
        config: Arc<ConfigStore>,
        metrics: Arc<ProcessMetrics>,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            config,
            metrics,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.config, self.metrics);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
