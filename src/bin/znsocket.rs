//! Command-line launcher for the znsocket server.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use znsocket::server::Server;

#[derive(Parser)]
#[command(name = "znsocket", version, about = "Redis-compatible data store over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a znsocket server.
    Server {
        /// Port to listen on.
        #[arg(long, default_value_t = 5000)]
        port: u16,

        /// Frame size limit in bytes; larger payloads are compressed and
        /// chunked.
        #[arg(long, alias = "max-http-buffer-size")]
        max_message_size: Option<usize>,

        /// Storage DSN (`memory` is the only built-in scheme).
        #[arg(long, default_value = "memory")]
        storage: String,
    },
    /// Probe a running server by connecting to its port.
    Healthcheck {
        /// Port to probe.
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Server {
            port,
            max_message_size,
            storage,
        } => {
            let mut builder = Server::builder().storage(storage);
            if let Some(bytes) = max_message_size {
                builder = builder.max_message_size(bytes);
            }
            let server = match builder.bind(&format!("0.0.0.0:{port}")).await {
                Ok(server) => server,
                Err(err) => {
                    eprintln!("startup failed: {err}");
                    return ExitCode::FAILURE;
                },
            };
            tokio::select! {
                result = server.run() => match result {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(err) => {
                        eprintln!("server failed: {err}");
                        ExitCode::FAILURE
                    },
                },
                _ = tokio::signal::ctrl_c() => ExitCode::SUCCESS,
            }
        },
        Commands::Healthcheck { port } => {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            }
        },
    }
}
