use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// MODELS

/// One feature flag as loaded from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub strategy_type: StrategyType,
    #[serde(default)]
    pub target_users: HashSet<String>,
    #[serde(default)]
    pub attribute_rules: Vec<AttributeRule>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub is_active: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl FlagDefinition {
    /// A minimal active, disabled, percentage-strategy flag. Mostly useful for tests and seeding.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            enabled: false,
            environment: Environment::default(),
            rollout_percentage: 0,
            strategy_type: StrategyType::default(),
            target_users: HashSet::new(),
            attribute_rules: Vec::new(),
            tags: Vec::new(),
            is_active: true,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = percentage;
        self
    }

    pub fn strategy(mut self, strategy: StrategyType) -> Self {
        self.strategy_type = strategy;
        self
    }

    pub fn target_user(mut self, user_id: impl Into<String>) -> Self {
        self.target_users.insert(user_id.into());
        self
    }

    pub fn attribute_rule(mut self, attribute: impl Into<String>, match_value: impl Into<String>) -> Self {
        self.attribute_rules.push(AttributeRule {
            attribute: attribute.into(),
            match_value: match_value.into(),
        });
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Checks the invariants a cached flag must hold.
    pub fn validate(&self) -> Result<(), String> {
        validate_flag_name(&self.name)?;
        validate_rollout_percentage(self.rollout_percentage)?;
        Ok(())
    }
}

/// An `{attribute, matchValue}` pair. Matches when the context attribute ends with `match_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRule {
    pub attribute: String,
    pub match_value: String,
}

impl AttributeRule {
    pub fn matches(&self, value: &str) -> bool {
        // an empty suffix would match everyone
        !self.match_value.is_empty() && value.ends_with(&self.match_value)
    }
}

/// Deserializes through [`FromStr`], so JSON accepts the same spellings as the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("Unknown environment '{}'", other)),
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    #[default]
    Percentage,
    UserTargeting,
    BranchBased,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Percentage => "percentage",
            StrategyType::UserTargeting => "user-targeting",
            StrategyType::BranchBased => "branch-based",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "percentage" => Ok(StrategyType::Percentage),
            "user-targeting" => Ok(StrategyType::UserTargeting),
            "branch-based" => Ok(StrategyType::BranchBased),
            other => Err(format!("Unknown strategy type '{}'", other)),
        }
    }
}

// HELPER FUNCTIONS

pub const MAX_FLAG_NAME_LEN: usize = 100;

// Validating the flag name
pub fn validate_flag_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Flag name cannot be empty".to_string());
    }

    if name.chars().count() > MAX_FLAG_NAME_LEN {
        return Err(format!("Flag name is too long (Max: {} characters)", MAX_FLAG_NAME_LEN));
    }

    Ok(())
}

// Checks if percentage number is between the number 0 to 100, both inclusive
pub fn validate_rollout_percentage(percentage: u8) -> Result<(), String> {
    if !(0..=100).contains(&percentage) {
        return Err("Rollout percentage must be between 0 to 100".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_flag_name() {
        assert!(validate_flag_name("beta").is_ok());
        assert!(validate_flag_name("").is_err());
        assert!(validate_flag_name("   ").is_err());
        assert!(validate_flag_name(&"a".repeat(MAX_FLAG_NAME_LEN)).is_ok());
        assert!(validate_flag_name(&"a".repeat(MAX_FLAG_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_rollout_bounds_inclusive() {
        assert!(validate_rollout_percentage(0).is_ok());
        assert!(validate_rollout_percentage(100).is_ok());
        assert!(validate_rollout_percentage(101).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("Dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("STAGING".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_environment_json_matches_parsing() {
        for (raw, expected) in [
            ("\"Prod\"", Environment::Prod),
            ("\"production\"", Environment::Prod),
            ("\"development\"", Environment::Dev),
            ("\"Staging\"", Environment::Staging),
        ] {
            assert_eq!(serde_json::from_str::<Environment>(raw).unwrap(), expected);
        }
        assert!(serde_json::from_str::<Environment>("\"qa\"").is_err());
        assert_eq!(serde_json::to_string(&Environment::Prod).unwrap(), "\"prod\"");
    }

    #[test]
    fn test_strategy_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&StrategyType::UserTargeting).unwrap(),
            "\"user-targeting\""
        );
        assert_eq!("branch-based".parse::<StrategyType>().unwrap(), StrategyType::BranchBased);
        assert!("rollout".parse::<StrategyType>().is_err());
    }

    #[test]
    fn test_attribute_rule_suffix_match() {
        let rule = AttributeRule {
            attribute: "email".to_string(),
            match_value: "@gla.ac.in".to_string(),
        };
        assert!(rule.matches("student@gla.ac.in"));
        assert!(!rule.matches("student@gmail.com"));

        let empty = AttributeRule {
            attribute: "email".to_string(),
            match_value: String::new(),
        };
        assert!(!empty.matches("anyone@example.com"));
    }

    #[test]
    fn test_definition_deserializes_from_store_document() {
        let json = serde_json::json!({
            "id": "6f1c2a5e-4a8b-4c57-9d1e-3b2f0c9a7e11",
            "name": "beta",
            "enabled": true,
            "environment": "production",
            "rolloutPercentage": 25,
            "strategyType": "user-targeting",
            "targetUsers": ["u1"],
            "attributeRules": [{ "attribute": "email", "matchValue": "@corp.com" }],
            "isActive": true,
            "version": 3,
            "updatedAt": "2025-01-01T00:00:00Z"
        });

        let flag: FlagDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(flag.environment, Environment::Prod);
        assert_eq!(flag.strategy_type, StrategyType::UserTargeting);
        assert!(flag.target_users.contains("u1"));
        assert_eq!(flag.attribute_rules[0].match_value, "@corp.com");
        assert!(flag.validate().is_ok());
    }
}
