use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use reservd::config::Config;
use reservd::notify::NotifyHub;
use reservd::store::{RetryPolicy, Store, StoreOptions};
use reservd::{ingress, observability, sweeper, trigger};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let options = StoreOptions {
        retry: RetryPolicy::default().with_max_attempts(config.tx_max_attempts),
        ..StoreOptions::default()
    };
    let store = Arc::new(Store::open(config.wal_path(), Arc::new(NotifyHub::new()), options)?);

    // Subscribe before spawning so no commit slips between startup sweep and feed.
    let changes = store.subscribe_changes();
    tokio::spawn(trigger::run_dispatcher(store.clone(), changes));
    tokio::spawn(sweeper::run_sweeper(store.clone(), config.sweep_interval, config.stale_pending));
    tokio::spawn(sweeper::run_compactor(store.clone(), config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("reservd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tx_max_attempts: {}", config.tx_max_attempts);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let store = store.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = ingress::process_connection(socket, store).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, max_connections).await;
    info!("reservd stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix. Registration errors surface at startup.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
    })
}

/// Wait up to ten seconds for open connections to release their permits.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    let open = || max_connections - semaphore.available_permits();
    info!("draining {} connections...", open());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while open() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("drain timeout, {} connections still open", open());
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("all connections drained");
}
