use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ChangeEvent, ChangeFeed, ChangeStream, FlagLoader};
use crate::error::{FeedError, LoadError};
use crate::flags::{AttributeRule, Environment, FlagDefinition, StrategyType};

/// Channel the `feature_flags` trigger notifies on (see `migrations/`).
pub const DEFAULT_NOTIFY_CHANNEL: &str = "flag_changes";

// Database row type for the full load
#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    enabled: bool,
    environment: String,
    rollout_percentage: i32,
    strategy_type: String,
    target_users: Vec<String>,
    attribute_rules: Json<Vec<AttributeRule>>,
    tags: Vec<String>,
    is_active: bool,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FlagRow> for FlagDefinition {
    type Error = LoadError;

    fn try_from(row: FlagRow) -> Result<Self, Self::Error> {
        let malformed = |reason: String| LoadError::MalformedRow {
            name: row.name.clone(),
            reason,
        };

        let environment = row.environment.parse::<Environment>().map_err(malformed)?;
        let strategy_type = row.strategy_type.parse::<StrategyType>().map_err(malformed)?;
        let rollout_percentage = u8::try_from(row.rollout_percentage)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| malformed(format!("rollout_percentage {} out of range", row.rollout_percentage)))?;

        Ok(FlagDefinition {
            id: row.id,
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            environment,
            rollout_percentage,
            strategy_type,
            target_users: row.target_users.into_iter().collect(),
            attribute_rules: row.attribute_rules.0,
            tags: row.tags,
            is_active: row.is_active,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

/// Loads active flags from the `feature_flags` table.
#[derive(Debug, Clone)]
pub struct PgFlagLoader {
    pool: PgPool,
    environment: Option<Environment>,
}

impl PgFlagLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, environment: None }
    }

    /// Only load flags for one environment.
    pub fn for_environment(mut self, environment: Option<Environment>) -> Self {
        self.environment = environment;
        self
    }
}

#[async_trait]
impl FlagLoader for PgFlagLoader {
    async fn load_active_flags(&self) -> Result<Vec<FlagDefinition>, LoadError> {
        let rows: Vec<FlagRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, enabled, environment, rollout_percentage, strategy_type,
                   target_users, attribute_rules, tags, is_active, version, updated_at
            FROM feature_flags
            WHERE is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // A bad row is skipped rather than failing the whole load, so one broken
        // flag cannot freeze every other flag at its old value.
        let flags = rows
            .into_iter()
            .filter_map(|row| match FlagDefinition::try_from(row) {
                Ok(flag) => Some(flag),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed flag row");
                    None
                }
            });

        Ok(in_environment(flags, self.environment))
    }
}

// Filtered after parsing so every spelling the column allows ("Prod", "production")
// lands in the same environment.
fn in_environment(
    flags: impl IntoIterator<Item = FlagDefinition>,
    environment: Option<Environment>,
) -> Vec<FlagDefinition> {
    flags
        .into_iter()
        .filter(|flag| environment.map_or(true, |env| flag.environment == env))
        .collect()
}

/// Postgres LISTEN/NOTIFY change feed.
#[derive(Debug, Clone)]
pub struct PgChangeFeed {
    pool: PgPool,
    channel: String,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> Result<ChangeStream, FeedError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;

        info!(channel = %self.channel, "Listening for flag changes");

        // try_recv reports a dropped connection as Ok(None). PgListener would
        // reconnect silently and lose whatever was notified in between, so the
        // stream ends there and the subscriber does a full reload on restart.
        let stream = futures::stream::unfold(Some(listener), |state| async move {
            let mut listener = state?;
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    let event = ChangeEvent {
                        payload: Some(notification.payload().to_string()),
                    };
                    Some((Ok(event), Some(listener)))
                }
                Ok(None) => Some((
                    Err(FeedError::ConnectionLost("postgres connection dropped".to_string())),
                    None,
                )),
                Err(e) => Some((Err(FeedError::from(e)), None)),
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> FlagRow {
        FlagRow {
            id: Uuid::new_v4(),
            name: "checkout".to_string(),
            description: Some("new checkout".to_string()),
            enabled: true,
            environment: "Prod".to_string(),
            rollout_percentage: 30,
            strategy_type: "user-targeting".to_string(),
            target_users: vec!["u1".to_string(), "u2".to_string()],
            attribute_rules: Json(vec![AttributeRule {
                attribute: "email".to_string(),
                match_value: "@corp.com".to_string(),
            }]),
            tags: vec!["payments".to_string()],
            is_active: true,
            version: 5,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_conversion() {
        let flag = FlagDefinition::try_from(row()).unwrap();
        assert_eq!(flag.environment, Environment::Prod);
        assert_eq!(flag.strategy_type, StrategyType::UserTargeting);
        assert_eq!(flag.rollout_percentage, 30);
        assert_eq!(flag.target_users.len(), 2);
        assert_eq!(flag.attribute_rules.len(), 1);
        assert_eq!(flag.version, 5);
    }

    #[test]
    fn test_row_with_bad_rollout_is_rejected() {
        let mut bad = row();
        bad.rollout_percentage = 140;
        assert!(matches!(
            FlagDefinition::try_from(bad),
            Err(LoadError::MalformedRow { .. })
        ));

        let mut negative = row();
        negative.rollout_percentage = -1;
        assert!(FlagDefinition::try_from(negative).is_err());
    }

    #[test]
    fn test_environment_filter_accepts_every_spelling() {
        let rows = ["Prod", "production", "prod", "development", "staging"]
            .into_iter()
            .enumerate()
            .map(|(i, environment)| {
                let mut flag_row = row();
                flag_row.name = format!("flag-{}", i);
                flag_row.environment = environment.to_string();
                FlagDefinition::try_from(flag_row).unwrap()
            })
            .collect::<Vec<_>>();

        assert_eq!(in_environment(rows.clone(), Some(Environment::Prod)).len(), 3);
        assert_eq!(in_environment(rows.clone(), Some(Environment::Dev)).len(), 1);
        assert_eq!(in_environment(rows.clone(), Some(Environment::Staging)).len(), 1);
        assert_eq!(in_environment(rows, None).len(), 5);
    }

    #[test]
    fn test_row_with_unknown_strategy_is_rejected() {
        let mut bad = row();
        bad.strategy_type = "geo".to_string();
        assert!(FlagDefinition::try_from(bad).is_err());
    }
}
