use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::console::Console;
use server::network::{Server, ServerError};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinError;

/// Main-method of the server.
/// Parses command-line arguments, folds them into the console variables and
/// runs the control loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Rendezvous port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Maximum number of concurrent sessions (1-8)
        #[clap(short, long)]
        max_players: Option<usize>,
        /// Seconds of silence before a session is dropped
        #[clap(long)]
        message_timeout: Option<f64>,
        /// Session tick rate (ticks per second)
        #[clap(short, long)]
        tick_rate: Option<u32>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let console = Arc::new(Console::with_defaults());
    if let Some(max_players) = args.max_players {
        console.cvars.set("maxplayers", &max_players.to_string())?;
    }
    if let Some(timeout) = args.message_timeout {
        console.cvars.set("net_messagetimeout", &timeout.to_string())?;
    }
    if let Some(rate) = args.tick_rate.filter(|r| *r > 0) {
        console.cvars.set("sys_ticrate", &(1.0 / rate as f64).to_string())?;
    }

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        ..ServerConfig::from_cvars(&console.cvars)
    };
    info!(
        "Starting server: max players {}, message timeout {:?}, tick {:?}",
        config.max_players, config.message_timeout, config.tick_interval
    );

    let server = Arc::new(Server::bind(config, console).await?);

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    // Handle shutdown gracefully
    let finished = tokio::select! {
        result = &mut runner => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            None
        }
    };

    server.shutdown().await;
    let result = match finished {
        Some(result) => result,
        None => runner.await,
    };
    control_loop_outcome(result)
}

/// Turns the control loop task's result into the process result, so a fatal
/// loop exit ends the process with an error.
fn control_loop_outcome(
    result: Result<Result<(), ServerError>, JoinError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Server stopped on a fatal error");
            Err(e.into())
        }
        Err(e) => {
            error!("Control loop task panicked: {}", e);
            Err(e.into())
        }
    }
}
