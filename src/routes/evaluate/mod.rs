pub mod routes;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::evaluation::EvaluationContext;

// Query string for a single check, e.g. `/check/beta?userId=u1&email=a@corp.com`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckQuery {
    #[serde(alias = "id")]
    pub user_id: Option<String>,
    pub email: Option<String>,
}

impl From<CheckQuery> for EvaluationContext {
    fn from(query: CheckQuery) -> Self {
        let mut context = EvaluationContext::new();
        if let Some(user_id) = query.user_id {
            context = context.with_user_id(user_id);
        }
        if let Some(email) = query.email {
            context = context.with_email(email);
        }
        context
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub feature: String,
    pub enabled: bool,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub context: EvaluationContext,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub generation: u64,
    pub flags: BTreeMap<String, FlagState>,
}

#[derive(Debug, Serialize)]
pub struct FlagState {
    pub enabled: bool,
    pub reason: String,
}
