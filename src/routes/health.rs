use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;
use crate::subscriber::{SubscriberState, SubscriberStats};

#[derive(Serialize)]
pub struct HealthData {
    status: u16,
    ready: bool,
    generation: Option<u64>,
    loaded_at: Option<DateTime<Utc>>,
    flags: usize,
    subscriber: SubscriberState,
    stats: SubscriberStats,
}

/// 200 once the first load has landed, 503 before that.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthData>) {
    let snapshot = state.cache.current_snapshot().ok();
    let code = if snapshot.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let health_data = HealthData {
        status: code.as_u16(),
        ready: snapshot.is_some(),
        generation: snapshot.as_ref().map(|s| s.generation()),
        loaded_at: snapshot.as_ref().map(|s| s.loaded_at()),
        flags: snapshot.as_ref().map(|s| s.len()).unwrap_or(0),
        subscriber: state.subscriber.state(),
        stats: state.subscriber.stats(),
    };
    (code, Json(health_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::CacheManager;
    use crate::flags::FlagDefinition;
    use crate::store::MemoryStore;
    use crate::subscriber::{ChangeFeedSubscriber, SubscriberConfig};

    #[tokio::test]
    async fn test_health_reports_load_time_once_ready() {
        let store = Arc::new(MemoryStore::new(vec![FlagDefinition::new("beta")]));
        let cache = Arc::new(CacheManager::default());
        let handle = ChangeFeedSubscriber::new(
            Arc::clone(&cache),
            store.clone(),
            store,
            SubscriberConfig::default(),
        )
        .spawn();
        let state = AppState {
            cache,
            subscriber: handle.control(),
        };

        // the subscriber task has not run yet
        let (code, Json(data)) = health(State(state.clone())).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!data.ready);
        assert!(data.loaded_at.is_none());

        assert!(handle.wait_until_listening().await);

        let (code, Json(data)) = health(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(data.flags, 1);
        assert!(data.loaded_at.is_some());

        handle.shutdown().await;
    }
}
