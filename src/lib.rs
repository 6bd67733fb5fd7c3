//! In-memory feature flag evaluation backed by a store that pushes change notifications.
//!
//! - [`cache::CacheManager`] holds the current [`snapshot::FlagSnapshot`] behind an atomic pointer.
//! - [`evaluation`] answers "is this flag on for this user" against a snapshot, without I/O.
//! - [`subscriber::ChangeFeedSubscriber`] keeps the cache in step with the store and restarts itself on failure.
//! - [`store`] defines the loader and change-feed seams, with Postgres and in-memory implementations.

pub mod cache;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod flags;
pub mod routes;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod subscriber;

pub use cache::CacheManager;
pub use error::{CacheNotReady, ConfigError, FeedError, LoadError, RefreshError};
pub use evaluation::{evaluate, evaluate_detailed, EvaluationContext, EvaluationResult};
pub use flags::FlagDefinition;
pub use snapshot::FlagSnapshot;
pub use subscriber::{ChangeFeedSubscriber, SubscriberHandle};
