use clap::Parser;
use tunlink::config::Mode;
use tunlink::{app, utils};

/// Tunlink VPN client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = utils::init_tracing() {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let args = Args::parse();
    tracing::info!("starting client with {}", args.config);

    if let Err(e) = app::run(Mode::Client, &args.config).await {
        tracing::error!("client error: {}", e);
        std::process::exit(1);
    }
}
