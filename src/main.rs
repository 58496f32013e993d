use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use rust_ofp_channel::config::ControllerConfig;
use rust_ofp_channel::ofp_controller::Controller;
use rust_ofp_channel::openflow0x01::{message, OFP_VERSION};
use rust_ofp_channel::repeater_hub::RepeaterHub;

#[derive(Parser)]
#[command(name = "rust_ofp_controller", about = "OpenFlow 1.0 repeater hub controller")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        rust_ofp_channel::logging::init_json();
    } else {
        rust_ofp_channel::logging::init();
    }

    let mut config = match &cli.config {
        Some(path) => match ControllerConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ControllerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    // The hub only speaks OpenFlow 1.0.
    if config.versions != [OFP_VERSION] {
        tracing::warn!(configured = ?config.versions, "offering OpenFlow 1.0 only");
        config.versions = vec![OFP_VERSION];
    }

    let controller = match Controller::new(config, message::codec(), RepeaterHub::new())
        .bind()
        .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to bind: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
    };
    if let Err(e) = controller.run_until(shutdown).await {
        tracing::error!("controller failed: {e}");
        std::process::exit(1);
    }
}
