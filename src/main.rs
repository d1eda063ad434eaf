use anyhow::Result;
use sunny::config::CONFIG;
use sunny::console::{Console, OperatorCommand, Reply};
use sunny::fleet::FleetChange;
use sunny::util::setup_logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging(&CONFIG.log_level);
    info!("Operator console starting...");

    let console = Console::from_config(&CONFIG, env!("CARGO_PKG_NAME"))?;
    info!(
        "{} endpoint(s) configured, manual period {:?}",
        console.settings().endpoints.len(),
        console.settings().period
    );

    let changes_handle = spawn_change_logger(console.fleet.subscribe());
    let status_handle = spawn_status_logger(console.connection.watch());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type 'help' for commands.");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match OperatorCommand::parse(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match console.execute(command).await {
                    Ok(Reply::Text(text)) => println!("{}", text),
                    Ok(Reply::Quit) => break,
                    Err(e) => println!("Error: {:#}", e),
                }
            }
            result = signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("Failed to listen for shutdown signal: {}", err);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    for path in console.shutdown() {
        println!("Exported {}", path.display());
    }
    changes_handle.abort();
    status_handle.abort();
    info!("Operator console stopped");
    Ok(())
}

fn spawn_change_logger(
    mut changes: broadcast::Receiver<FleetChange>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(FleetChange::Arrived {
                    vehicle_id,
                    notification_id,
                }) => {
                    println!("{} reached its destination ({})", vehicle_id, notification_id);
                }
                Ok(change) => debug!("Fleet change: {:?}", change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Fleet change log skipped {} update(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_status_logger(
    mut status: tokio::sync::watch::Receiver<sunny::relay::ConnectionStatus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!("Relay {:?} {}", current.state, current.endpoint.unwrap_or_default());
        }
    })
}
