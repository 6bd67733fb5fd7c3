use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::info;

use crate::state::AppState;
use crate::subscriber::SubscriberState;

#[derive(Serialize)]
pub struct RefreshResponse {
    accepted: bool,
    subscriber: SubscriberState,
}

/// Out-of-band reload, for when a change notification was missed.
pub async fn refresh(State(state): State<AppState>) -> (StatusCode, Json<RefreshResponse>) {
    info!("Forced refresh requested over HTTP");
    state.subscriber.force_refresh();

    (
        StatusCode::ACCEPTED,
        Json(RefreshResponse {
            accepted: true,
            subscriber: state.subscriber.state(),
        }),
    )
}
