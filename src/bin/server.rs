use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use respwire::{Context, Error, Handler, Request, ResponseWriter, Server, ServerConfig};
use tokio::net::TcpListener;
use tracing::{debug, info};

const PORT: u16 = 6379;

#[derive(Parser, Debug)]
struct Args {
    /// The port to listen on
    #[arg(short, long, default_value_t = PORT, env = "RESPWIRE_PORT")]
    port: u16,

    /// Timeout for reading each request value, in milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Timeout for writing each reply value, in milliseconds
    #[arg(long)]
    write_timeout_ms: Option<u64>,

    /// Close connections idle for longer than this, in milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// How long a graceful shutdown may take before connections are dropped, in milliseconds
    #[arg(long, default_value_t = 5000)]
    shutdown_timeout_ms: u64,
}

/// Replies to every command with its arguments.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn serve(&self, res: &mut ResponseWriter<'_>, req: &mut Request) -> respwire::Result<()> {
        if req.cmd.eq_ignore_ascii_case("PING") && req.args.is_empty() {
            return res.write(respwire::Value::Simple("PONG".into())).await;
        }

        res.stream(req.args.len()).await?;
        let mut arg = Vec::new();
        while req.args.next(&mut arg).await {
            res.write(arg.clone()).await?;
        }
        req.args.close().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let config = ServerConfig {
        read_timeout: args.read_timeout_ms.map(Duration::from_millis),
        write_timeout: args.write_timeout_ms.map(Duration::from_millis),
        idle_timeout: args.idle_timeout_ms.map(Duration::from_millis),
    };

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let server = Server::new(Echo, config);

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let ctx = Context::background().with_timeout(Duration::from_millis(args.shutdown_timeout_ms));
    if let Err(err) = server.shutdown(&ctx).await {
        info!(cause = %err, "graceful shutdown did not complete, closing connections");
        server.close();
    }

    serving.await.map_err(|e| Error::from(std::io::Error::other(e)))?
}
