use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Cursor;

use murmur3::murmur3_32;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cache::CacheManager;
use crate::error::CacheNotReady;
use crate::flags::{FlagDefinition, StrategyType};
use crate::snapshot::FlagSnapshot;

/// Number of rollout buckets. Buckets range over `0..BUCKETS`.
pub const BUCKETS: u32 = 100;

// User context for evaluation
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub user_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_email(self, email: impl Into<String>) -> Self {
        self.with_attribute("email", email)
    }

    /// The user id, ignoring blank values.
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Why an evaluation came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationReason {
    FlagNotFound,
    Disabled,
    TargetedUser,
    AttributeRule { attribute: String },
    RolloutIncluded { bucket: u32 },
    RolloutExcluded { bucket: u32 },
    AnonymousRollout { included: bool },
    NoRuleMatched,
    CacheNotReady,
}

impl fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationReason::FlagNotFound => write!(f, "Flag not found"),
            EvaluationReason::Disabled => write!(f, "Flag is globally disabled"),
            EvaluationReason::TargetedUser => write!(f, "Matched target user"),
            EvaluationReason::AttributeRule { attribute } => write!(f, "Matched {} rule", attribute),
            EvaluationReason::RolloutIncluded { bucket } => write!(f, "User in rollout (bucket {})", bucket),
            EvaluationReason::RolloutExcluded { bucket } => write!(f, "User not in rollout (bucket {})", bucket),
            EvaluationReason::AnonymousRollout { included } => {
                write!(f, "Anonymous rollout coin flip ({})", if *included { "in" } else { "out" })
            }
            EvaluationReason::NoRuleMatched => write!(f, "No rule matched"),
            EvaluationReason::CacheNotReady => write!(f, "Flag cache not ready"),
        }
    }
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationResult {
    pub enabled: bool,
    pub reason: EvaluationReason,
}

impl EvaluationResult {
    fn on(reason: EvaluationReason) -> Self {
        Self { enabled: true, reason }
    }

    fn off(reason: EvaluationReason) -> Self {
        Self { enabled: false, reason }
    }
}

/// Evaluate if a flag should be enabled for a given context.
pub fn evaluate(snapshot: &FlagSnapshot, flag_name: &str, context: &EvaluationContext) -> bool {
    evaluate_detailed(snapshot, flag_name, context).enabled
}

/// Like [`evaluate`], but also reports which rule decided the outcome.
///
/// First match wins:
/// 1. Unknown or disabled flag is off
/// 2. Targeted user (user-targeting strategy only)
/// 3. Attribute rules, in order
/// 4. Percentage rollout on a stable per-user bucket
/// 5. Off
pub fn evaluate_detailed(
    snapshot: &FlagSnapshot,
    flag_name: &str,
    context: &EvaluationContext,
) -> EvaluationResult {
    match snapshot.get(flag_name) {
        Some(flag) => evaluate_flag(flag, context),
        None => EvaluationResult::off(EvaluationReason::FlagNotFound),
    }
}

/// Evaluate every flag in the snapshot for one context.
pub fn evaluate_all(snapshot: &FlagSnapshot, context: &EvaluationContext) -> BTreeMap<String, EvaluationResult> {
    snapshot
        .iter()
        .map(|flag| (flag.name.clone(), evaluate_flag(flag, context)))
        .collect()
}

/// Evaluate against whatever snapshot the cache currently holds.
///
/// Returns `CacheNotReady` before the first successful load so callers can choose
/// whether to fail open or closed.
pub fn evaluate_with_cache(
    cache: &CacheManager,
    flag_name: &str,
    context: &EvaluationContext,
) -> Result<EvaluationResult, CacheNotReady> {
    let snapshot = cache.current_snapshot()?;
    Ok(evaluate_detailed(&snapshot, flag_name, context))
}

fn evaluate_flag(flag: &FlagDefinition, context: &EvaluationContext) -> EvaluationResult {
    // Step 1: If flag is globally disabled, return false
    if !flag.enabled {
        return EvaluationResult::off(EvaluationReason::Disabled);
    }

    let user_id = context.user_id();

    // Step 2: Explicit user targeting
    if flag.strategy_type == StrategyType::UserTargeting {
        if let Some(user_id) = user_id {
            if flag.target_users.contains(user_id) {
                return EvaluationResult::on(EvaluationReason::TargetedUser);
            }
        }
    }

    // Step 3: Attribute rules in declared order
    for rule in &flag.attribute_rules {
        if let Some(value) = context.attributes.get(&rule.attribute) {
            if rule.matches(value) {
                return EvaluationResult::on(EvaluationReason::AttributeRule {
                    attribute: rule.attribute.clone(),
                });
            }
        }
    }

    // Step 4: Percentage rollout
    if flag.rollout_percentage > 0 {
        let percentage = u32::from(flag.rollout_percentage);

        return match user_id {
            Some(user_id) => {
                let bucket = rollout_bucket(&flag.name, user_id);
                if bucket < percentage {
                    EvaluationResult::on(EvaluationReason::RolloutIncluded { bucket })
                } else {
                    EvaluationResult::off(EvaluationReason::RolloutExcluded { bucket })
                }
            }
            None => {
                // Anonymous contexts have no stable identity to hash, so this is a
                // weighted coin flip and is not reproducible between calls.
                let included = rand::thread_rng().gen_range(0..BUCKETS) < percentage;
                EvaluationResult {
                    enabled: included,
                    reason: EvaluationReason::AnonymousRollout { included },
                }
            }
        };
    }

    // Step 5: Default
    EvaluationResult::off(EvaluationReason::NoRuleMatched)
}

/// Stable bucket in `0..100` for a user on a flag.
///
/// murmur3 over `"{flag}.{user}"` so the result survives restarts and differs between flags.
pub fn rollout_bucket(flag_name: &str, user_id: &str) -> u32 {
    let input = format!("{}.{}", flag_name, user_id);
    let hash = murmur3_32(&mut Cursor::new(input.as_bytes()), 0).unwrap_or(0);
    hash % BUCKETS
}
