//! Boundary to the persistent store.
//!
//! The engine never writes to the store. It only needs two things from it: a full
//! load of the active flags, and a feed that says "something changed".

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{FeedError, LoadError};
use crate::flags::FlagDefinition;

pub use memory::MemoryStore;
pub use postgres::{PgChangeFeed, PgFlagLoader};

/// Opaque change signal. The payload is kept for logging only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    pub payload: Option<String>,
}

/// Stream of change events. Ends, or yields an error, when the connection is lost.
/// Dropping it unsubscribes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Loads the full set of active flags.
#[async_trait]
pub trait FlagLoader: Send + Sync {
    /// Must only return flags with `is_active == true`.
    async fn load_active_flags(&self) -> Result<Vec<FlagDefinition>, LoadError>;
}

/// Opens subscriptions to the store's change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeStream, FeedError>;
}
