//! Broker lifecycle commands (status, snapshot).

use broker_config_and_utils::Paths;
use broker_ipc::BrokerClient;

/// Check broker status.
pub async fn check_status(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = paths.socket_file();

    if !socket_path.exists() {
        println!("Broker is not running (socket not found)");
        return Ok(());
    }

    let mut client = match BrokerClient::connect_unix(&socket_path).await {
        Ok(client) => client,
        Err(e) => {
            println!("Failed to connect to broker: {}", e);
            println!("Broker may not be running or socket may be stale");
            return Ok(());
        }
    };

    let hello = client.hello().await?;
    let metrics = client.metrics().await?;
    let pid = std::fs::read_to_string(paths.pid_file()).ok();

    println!("Broker is running");
    println!("  Protocol: {}", hello["version"]);
    if let Some(pid) = pid {
        println!("  PID:      {}", pid.trim());
    }
    println!("  Socket:   {}", socket_path.display());
    println!("  Streams:  {}", metrics.totals.streams);
    println!("  Depth:    {}", metrics.totals.depth);
    println!("  Inflight: {}", metrics.totals.inflight);
    for entry in &metrics.streams {
        println!(
            "    {:<24} depth={} inflight={} consumers={} in={} out={}",
            entry.id,
            entry.stats.depth,
            entry.stats.inflight,
            entry.stats.consumers,
            entry.stats.rate_in,
            entry.stats.rate_out
        );
    }

    Ok(())
}

/// Print every stream's pending and inflight envelopes as JSON.
pub async fn print_snapshot(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = BrokerClient::connect_unix(paths.socket_file()).await?;
    client.hello().await?;
    let rows = client.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
