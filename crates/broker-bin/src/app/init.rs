//! Broker initialization.

use broker_backends::{BlobStore, FsBlobStore, MemoryBlobStore, MemoryJobQueue};
use broker_config_and_utils::{init_logging, Config, Paths};
use broker_ipc::{Broker, BrokerClient, BrokerOptions, BrokerServer};
use std::sync::Arc;
use stream_store::StreamStore;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Run the broker until a shutdown signal or a fatal store error.
pub async fn run_broker(
    config: Config,
    paths: Paths,
    foreground: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Singleton enforcement: refuse to start over a live broker
    let socket_path = paths.socket_file();
    if socket_path.exists() {
        if BrokerClient::is_broker_running(&socket_path).await {
            return Err(format!(
                "broker is already running on {}",
                socket_path.display()
            )
            .into());
        }
        eprintln!("Removing stale socket file");
        let _ = std::fs::remove_file(&socket_path);
    }

    paths.ensure_dirs()?;
    init_logging(&config.log_level, &paths.log_file(), foreground)?;

    let pid = std::process::id();
    std::fs::write(paths.pid_file(), pid.to_string())?;
    info!(pid, "Broker started");

    let broker = Arc::new(build_broker(&config));
    info!(
        max_stream_depth = ?config.max_stream_depth,
        ack_timeout_ms = ?config.ack_timeout_ms,
        max_redeliveries = ?config.max_redeliveries,
        blob_offload_bytes = ?config.blob_offload_bytes,
        dead_letter_queue = ?config.dead_letter_queue,
        "Configuration loaded"
    );

    let mut server = BrokerServer::new(&socket_path, broker)
        .with_sweep_interval(config.sweep_interval());
    if let Some(addr) = &config.listen_addr {
        server = server.with_tcp(addr);
    }

    tokio::spawn(wait_for_signal(server.shutdown_sender()));

    let server_result = server.run().await;

    // Cleanup
    let _ = std::fs::remove_file(paths.pid_file());
    let _ = std::fs::remove_file(&socket_path);

    match &server_result {
        Ok(()) => info!("Broker stopped"),
        Err(e) => error!(error = %e, "Broker stopped abnormally"),
    }

    server_result.map_err(|e| e.into())
}

/// Assemble the broker from configuration.
pub(crate) fn build_broker(config: &Config) -> Broker {
    let blobs: Arc<dyn BlobStore> = match &config.blob_dir {
        Some(dir) => Arc::new(FsBlobStore::new(dir)),
        None => Arc::new(MemoryBlobStore::new()),
    };
    let options = BrokerOptions {
        max_frame_bytes: config.max_frame_bytes,
        blob_offload_bytes: config.blob_offload_bytes,
    };

    let broker = Broker::new(StreamStore::new(config.store_policy()), options)
        .with_blob_store(blobs)
        .with_idempotency_ttl(config.idempotency_ttl());

    match &config.dead_letter_queue {
        Some(queue) => broker.with_dead_letter_queue(Arc::new(MemoryJobQueue::new()), queue),
        None => broker,
    }
}

/// Trigger shutdown on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: broadcast::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    let _ = shutdown.send(());
}
