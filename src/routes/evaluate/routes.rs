use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::evaluation::{evaluate_all, evaluate_with_cache, EvaluationContext};
use crate::state::AppState;
use super::{CheckQuery, CheckResponse, EvaluateRequest, EvaluateResponse, FlagState};

/// Evaluate one flag for the user described by the query string
pub async fn check(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, (StatusCode, String)> {
    let context = EvaluationContext::from(query);

    let result = evaluate_with_cache(&state.cache, &feature, &context)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(CheckResponse {
        feature,
        enabled: result.enabled,
        reason: result.reason.to_string(),
    }))
}

/// Evaluate every cached flag for one context
pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, (StatusCode, String)> {
    let snapshot = state
        .cache
        .current_snapshot()
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let flags = evaluate_all(&snapshot, &request.context)
        .into_iter()
        .map(|(name, result)| {
            (
                name,
                FlagState {
                    enabled: result.enabled,
                    reason: result.reason.to_string(),
                },
            )
        })
        .collect();

    Ok(Json(EvaluateResponse {
        generation: snapshot.generation(),
        flags,
    }))
}
