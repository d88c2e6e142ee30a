use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    middleware::{auth_middleware, log_errors},
};

pub mod discover;
pub mod health;

// 组装全部路由；限流和CORS依赖运行环境，由 main 叠加
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::ping));

    let protected_routes = Router::new()
        .route("/discover/toggle", post(discover::toggle_discover))
        .route("/discover/update-location", post(discover::update_location))
        .route("/discover/heartbeat", post(discover::heartbeat))
        .route("/discover/nearby", post(discover::find_nearby))
        .route("/discover/verify-beacon", post(discover::verify_beacon))
        .route("/discover/me", get(discover::my_presence))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let api = Router::new().merge(public_routes).merge(protected_routes);
    let base = state.config.api_base_uri.trim_end_matches('/').to_string();

    // axum 不允许在根路径 nest
    let router = if base.is_empty() {
        api
    } else {
        Router::new().nest(&base, api)
    };

    router
        .layer(axum::middleware::from_fn(log_errors))
        .with_state(state)
}
