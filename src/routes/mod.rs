use axum::{
    routing::{get, post},
    Router,
};

mod admin;
mod evaluate;
mod health;

pub use health::health;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let admin_router = Router::new().route("/refresh", post(admin::refresh));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/check/{feature}", get(evaluate::routes::check))
        .route("/evaluate", post(evaluate::routes::evaluate))
        .nest("/admin", admin_router)
}

async fn root() -> &'static str {
    "Flag evaluation engine"
}
