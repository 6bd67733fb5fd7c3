use std::sync::Arc;

use crate::cache::CacheManager;
use crate::subscriber::SubscriberControl;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
    pub subscriber: SubscriberControl,
}
