// Subflow API server
// Authentication is delegated to the fronting proxy; the engine only
// consumes the authenticated user from the x-user header.

mod error;
mod processes;
mod settings;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use subflow_engine::{Engine, EngineConfig};
use subflow_storage::{PostgresProcessStore, ProcessStore};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        processes::start_process,
        processes::list_processes,
        processes::get_process,
        processes::resume_process,
        processes::abort_process,
        processes::deliver_callback,
        settings::engine_status,
        settings::set_pause,
        settings::bulk_resume,
    ),
    components(
        schemas(
            processes::ProcessResponse,
            processes::ProcessStepResponse,
            processes::ProcessDetailResponse,
            processes::StartResponse,
            processes::ListProcessesParams,
            settings::SetPauseRequest,
            settings::BulkResumeResponse,
        )
    ),
    tags(
        (name = "processes", description = "Start, resume, abort and inspect processes"),
        (name = "settings", description = "Engine pause lock and maintenance")
    ),
    info(
        title = "Subflow API",
        version = "0.2.0",
        description = "Control surface of the subscription workflow engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subflow_api=debug,subflow_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("subflow-api starting...");

    // Initialize database
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresProcessStore::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    // Build the engine. Deployments register their workflows here; the
    // built-in maintenance tasks are always available.
    let config = EngineConfig::from_env();
    tracing::info!(
        max_workers = config.max_workers,
        testing = config.testing,
        "engine configured"
    );
    let engine = Engine::builder(Arc::new(store) as Arc<dyn ProcessStore>)
        .config(config)
        .build()
        .context("Failed to build engine")?;

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .merge(processes::routes(processes::AppState {
            engine: engine.clone(),
        }))
        .merge(settings::routes(settings::AppState {
            engine: engine.clone(),
        }))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = std::env::var("SUBFLOW_LISTEN").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
