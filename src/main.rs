use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tryout_backend::{
    config::{get_config, init_config},
    database::pool::create_pool,
    middleware, routes, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    init_config()?;
    let config = get_config();

    let pool = create_pool().await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let app_state = AppState::new(pool);

    {
        let state = app_state.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                state.content_service.purge_caches();
            }
        });
    }

    let base_routes = Router::new().route("/health", get(routes::health::health));

    let content_api = Router::new()
        .route("/api/tryouts/:id", get(routes::tryout::get_tryout))
        .layer(axum::middleware::from_fn_with_state(
            middleware::rate_limit::new_rps_state(config.api_rps),
            middleware::rate_limit::rps_middleware,
        ));

    let attempt_api = Router::new()
        .route(
            "/api/tryouts/:tryout_id/attempts",
            post(routes::attempt::start_attempt),
        )
        .route(
            "/api/tryouts/:tryout_id/attempt",
            get(routes::attempt::get_attempt),
        )
        .route(
            "/api/attempts/:id/progress",
            patch(routes::attempt::save_progress),
        )
        .route(
            "/api/attempts/:id/progress/batch",
            post(routes::attempt::save_progress_batch),
        )
        .route(
            "/api/attempts/:id/submit",
            post(routes::attempt::submit_attempt),
        )
        .route("/api/attempts/:id/plan", patch(routes::attempt::update_plan))
        .layer(axum::middleware::from_fn(
            middleware::auth::require_bearer_auth,
        ))
        .layer(axum::middleware::from_fn_with_state(
            middleware::rate_limit::new_rps_state(config.api_rps),
            middleware::rate_limit::rps_middleware,
        ));

    let app = base_routes
        .merge(content_api)
        .merge(attempt_api)
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024));

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
