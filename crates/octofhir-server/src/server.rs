use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bootstrap::bootstrap;
use crate::context::ApplicationContext;
use crate::error::BootstrapError;
use crate::operations::{
    instance_operation_handler, merged_root_get_handler, merged_root_post_handler,
    merged_type_get_handler, merged_type_post_handler,
};
use crate::registry::ProviderRegistry;
use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub config: Arc<AppConfig>,
}

pub struct OctofhirServer {
    addr: SocketAddr,
    app: Router,
}

pub fn build_app(cfg: &AppConfig, registry: Arc<ProviderRegistry>) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let state = AppState {
        registry,
        config: Arc::new(cfg.clone()),
    };

    let fhir = Router::new()
        .route("/metadata", get(handlers::metadata))
        .route(
            "/{param}",
            get(merged_root_get_handler).post(merged_root_post_handler),
        )
        .route(
            "/{resource_type}/{param}",
            get(merged_type_get_handler)
                .post(merged_type_post_handler)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route(
            "/{resource_type}/{id}/{operation}",
            get(instance_operation_handler).post(instance_operation_handler),
        );

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .nest(&cfg.fhir.base_path, fhir)
        .with_state(state)
        // Outermost layer last: body limit, request id, trace, cors, content negotiation
        .layer(middleware::from_fn(app_middleware::content_negotiation))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    context: Option<ApplicationContext>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            context: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Beans to bootstrap from; defaults to the in-memory context for the
    /// configured resource types.
    pub fn with_context(mut self, context: ApplicationContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Runs the bootstrapper and builds the router.
    pub fn build(self) -> Result<OctofhirServer, BootstrapError> {
        let context = self
            .context
            .unwrap_or_else(|| ApplicationContext::in_memory(&self.config));
        let registry = bootstrap(&self.config, &context)?;
        let app = build_app(&self.config, Arc::new(registry));

        Ok(OctofhirServer {
            addr: self.addr,
            app,
        })
    }
}

impl OctofhirServer {
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
