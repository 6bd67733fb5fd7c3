use std::sync::Arc;

use flag_engine::config::Config;
use flag_engine::routes;
use flag_engine::state::AppState;
use flag_engine::store::{PgChangeFeed, PgFlagLoader};
use flag_engine::subscriber::{ChangeFeedSubscriber, SubscriberConfig, SubscriberControl};
use flag_engine::CacheManager;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    // lazy, so an unreachable database at boot is retried by the subscriber instead of aborting
    let db = PgPoolOptions::new().connect_lazy(&config.database_url)?;

    let cache = Arc::new(CacheManager::new(config.refresh_timeout));
    let loader = Arc::new(PgFlagLoader::new(db.clone()).for_environment(config.environment));
    let feed = Arc::new(PgChangeFeed::new(db.clone(), config.notify_channel.clone()));

    let subscriber = ChangeFeedSubscriber::new(
        Arc::clone(&cache),
        loader,
        feed,
        SubscriberConfig { backoff: config.backoff },
    )
    .spawn();

    match tokio::time::timeout(config.startup_wait, subscriber.wait_until_listening()).await {
        Ok(true) => info!(generation = ?cache.generation(), "Flag cache ready"),
        _ => warn!(
            wait_secs = config.startup_wait.as_secs(),
            "Flag cache not loaded yet, serving with evaluations reporting not ready"
        ),
    }

    reload_on_sighup(subscriber.control());

    let state = AppState {
        cache,
        subscriber: subscriber.control(),
    };
    let app = routes::routes().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    info!(addr = %config.addr(), "server is chilling");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop listening to the store before the pool goes away
    subscriber.shutdown().await;
    db.close().await;
    info!("Shut down cleanly");

    Ok(())
}

#[cfg(unix)]
fn reload_on_sighup(control: SubscriberControl) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Could not install SIGHUP handler");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            info!("SIGHUP: forcing flag cache reload");
            control.force_refresh();
        }
    });
}

#[cfg(not(unix))]
fn reload_on_sighup(_control: SubscriberControl) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
