//! Interop test client.
//!
//! Runs one named test case against an interop server and prints
//! `OK: <test_case>` on success.

use clap::Parser;
use weft_interop::{run_test_case, InteropOptions};

#[derive(Parser)]
#[command(name = "interop-client")]
#[command(about = "weft interop test client", long_about = None)]
struct Cli {
    #[arg(long, default_value = "localhost")]
    server_host: String,

    #[arg(long)]
    server_port: u16,

    /// Authority used for TLS hostname matching instead of the target.
    #[arg(long)]
    server_host_override: Option<String>,

    #[arg(long, default_value = "large_unary")]
    test_case: String,

    #[arg(long)]
    use_tls: bool,

    /// Pin the bundled test CA instead of the platform roots.
    #[arg(long)]
    use_test_ca: bool,

    /// Bearer token for the auth test cases.
    #[arg(long)]
    oauth_access_token: Option<String>,

    /// Expected authenticated identity (service account email).
    #[arg(long)]
    default_service_account: Option<String>,

    #[arg(long)]
    oauth_scope: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let opts = InteropOptions {
        server_host: cli.server_host,
        server_port: cli.server_port,
        server_host_override: cli.server_host_override,
        use_tls: cli.use_tls,
        use_test_ca: cli.use_test_ca,
        oauth_access_token: cli.oauth_access_token,
        default_service_account: cli.default_service_account,
        oauth_scope: cli.oauth_scope,
    };

    match run_test_case(&cli.test_case, &opts).await {
        Ok(()) => println!("OK: {}", cli.test_case),
        Err(e) => {
            eprintln!("FAILED: {}: {}", cli.test_case, e);
            std::process::exit(1);
        }
    }
}
