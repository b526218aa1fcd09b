//! View Gateway - HTTP service running handlers inside a request-scoped session.
//!
//! ## Architecture
//!
//! ```text
//! Client → ErrorPageLayer → OpenSessionLayer → Router (notes, error page)
//!               │                 │
//!               │                 └─ binds one SQLite session per dispatch
//!               └─ re-dispatches 4xx/5xx to /error (DispatchType::Error)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error_page;
pub mod routes;

pub use error_page::{ErrorAttributes, ErrorPageLayer, ErrorPageService};
pub use routes::{AppState, Note, ERROR_PATH, SCHEMA};

use axum::{Router, ServiceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use view_common::config::Config;
use view_session::{
    AppRegistry, DispatchPolicy, OpenSessionInView, OpenSessionLayer, OpenSessionService,
    SessionFactoryHandle, SqliteSessionFactory,
};

/// The full service stack.
pub type App = ErrorPageService<OpenSessionService<Router>>;

/// Open the session factory and register it.
pub fn open_registry(config: &Config) -> anyhow::Result<Arc<AppRegistry>> {
    let path = config.database.effective_path();
    let factory = SqliteSessionFactory::open(&path, SCHEMA)?.with_name("notes");
    tracing::info!(path = %path.display(), "Opened notes database");

    let registry = Arc::new(AppRegistry::new());
    registry.register(SessionFactoryHandle::new(factory));
    Ok(registry)
}

/// Build the gateway service with all routes and middleware.
pub fn build_app(config: &Config, registry: Arc<AppRegistry>) -> anyhow::Result<App> {
    let factory = registry.require::<SessionFactoryHandle>()?;
    let state = AppState {
        factory: (*factory).clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let router = routes::build_routes(state).layer(cors);

    let policy = DispatchPolicy::from(&config.session).exclude_path("/health");

    Ok(ServiceBuilder::new()
        .layer(ErrorPageLayer::new(ERROR_PATH))
        .layer(OpenSessionLayer::new(registry).with_policy(policy))
        .service(router))
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config.bind_address().parse()?;
    let registry = open_registry(config)?;

    // Startup check runs through the same guard the requests use.
    let guard = OpenSessionInView::new(registry.clone());
    let factory = guard.session_factory()?.clone();
    let notes = guard.process(async { routes::count_notes(&factory) }).await??;
    tracing::info!(notes, "Notes database ready");

    let app = build_app(config, registry)?;

    tracing::info!("Starting Session View gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
