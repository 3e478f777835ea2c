use airsense_server::persist::{
    retry_queue, Delivery, NullSink, PgSink, ReadingSink, RetryPolicy,
};
use airsense_server::{api, Listener, ReadingsStore, ServerConfig, SessionContext};
use std::sync::Arc;
use tokio::signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ServerConfig::load_or_default()?;

    let store = Arc::new(match config.store.dedup_window() {
        Some(window) => {
            info!("Dropping repeated reports within {:?}", window);
            ReadingsStore::with_dedup_window(window)
        }
        None => ReadingsStore::new(),
    });

    let sink: Arc<dyn ReadingSink> = match &config.database.url {
        Some(url) => Arc::new(PgSink::connect_lazy(url, &config.database)?),
        None => {
            warn!("No database configured, readings are kept in memory only");
            Arc::new(NullSink)
        }
    };
    info!(
        "Persisting to {} (table {})",
        sink.name(),
        config.database.table
    );

    let policy = RetryPolicy {
        interval: config.database.retry_interval(),
        max_attempts: config.database.max_attempts,
        timeout: config.database.persist_timeout(),
        capacity: config.database.queue_capacity,
    };
    let (retry, retry_worker) = retry_queue(sink.clone(), policy);
    tokio::spawn(retry_worker.run());

    let delivery = Delivery::new(sink, config.database.persist_timeout()).with_retry(retry);

    let ctx = Arc::new(SessionContext {
        store: store.clone(),
        delivery,
        protocol: config.protocol.clone(),
    });

    // Fan the shutdown signal out to the listener and the API
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Some(bind) = &config.api.bind {
        let api_listener = tokio::net::TcpListener::bind(bind).await?;
        let store = store.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_listener, store, wait_for(rx)).await {
                error!("Query API stopped: {}", e);
            }
        });
    }

    let listener =
        Listener::bind(&config.listener.bind, config.listener.max_connections, ctx).await?;
    info!(
        "Ingestion server listening on {} (max {} connections, settle {:?}, timeout {:?})",
        listener.local_addr()?,
        config.listener.max_connections,
        config.protocol.settle_delay(),
        config.protocol.receive_timeout()
    );

    listener.run_until(wait_for(shutdown_rx)).await?;

    info!(
        "Shutting down with {} readings from {} devices in memory",
        store.len().await,
        store.device_count().await
    );
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
