//! LongerPull server binary.

use anyhow::{Context, Result};
use clap::Parser;
use longerpull::{ErrorPolicy, Server, ServerConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "longerpull-server")]
#[command(about = "Bidirectional long-polling RPC server")]
struct Args {
    /// Address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    addr: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Queue length at which a connection's reader pauses.
    #[arg(long, default_value_t = 1)]
    pause_threshold: usize,

    /// Queue length at or below which a paused reader resumes.
    #[arg(long, default_value_t = 0)]
    resume_threshold: usize,

    /// Listen backlog passed to `listen(2)`.
    #[arg(long, default_value_t = 1024)]
    backlog: i32,

    /// Terminate a connection on handler error instead of replying with
    /// an error envelope.
    #[arg(long)]
    terminate_on_handler_error: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.addr,
        port: args.port,
        pause_threshold: args.pause_threshold,
        resume_threshold: args.resume_threshold,
        backlog: args.backlog,
        error_policy: if args.terminate_on_handler_error {
            ErrorPolicy::Terminate
        } else {
            ErrorPolicy::ReplyAndContinue
        },
    };

    info!(addr = %config.bind_addr, port = config.port, "starting longerpull server");
    let server = Server::new(config);

    tokio::select! {
        result = server.run() => {
            result.context("server loop exited with an error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
