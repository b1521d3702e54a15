use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use roth_convert::api::{Cli, Command, analyze_file, run_http_server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve { port, defaults } => {
            if let Err(e) = run_http_server(port, defaults).await {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        Command::Analyze {
            file,
            projection,
            defaults,
        } => match analyze_file(&file, &defaults, projection) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
    }
}
