//! Diameter EAP server
//!
//! Listens for Diameter clients `client0.test.realm` .. `clientN.test.realm`
//! and answers every Diameter-EAP-Request with DIAMETER_SUCCESS from a pool
//! of worker threads.

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use diam_node::{app_id, Application, DiameterMessage, Node, NodeConfig, ResultCode};

/// Diameter EAP test server
#[derive(Parser, Debug)]
#[command(name = "diam-eap-serverd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Diameter EAP test server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(default_value = "127.0.0.1")]
    server_ip: IpAddr,

    /// Port to listen on
    #[arg(default_value_t = diam_node::DIAMETER_PORT)]
    port: u16,

    /// Configuration file path (YAML); overrides the identity defaults
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Number of clients to accept (client0.test.realm ..)
    #[arg(long, default_value_t = 100)]
    peers: usize,

    /// Worker threads for the EAP application
    #[arg(long, default_value_t = 50)]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    log::info!("diam-eap-serverd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => NodeConfig::new("server.test.realm", "test.realm"),
    };
    let config = config.listen_on(vec![args.server_ip], Some(args.port));

    let node = Node::from_config(config)
        .await
        .context("creating Diameter node")?;

    let mut peers = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let peer = node
            .add_peer(&format!("aaa://client{i}.test.realm"), None, &[], false)
            .await
            .with_context(|| format!("adding peer client{i}.test.realm"))?;
        peers.push(peer);
    }

    let app = Application::builder(app_id::EAP)
        .auth()
        .pooled(args.workers)
        .handler(handle_request)
        .build()
        .context("building EAP application")?;
    node.add_application(&app, &peers)
        .await
        .context("registering EAP application")?;

    node.start().await.context("starting Diameter node")?;
    log::info!(
        "{} ready on {:?} ({} peers, {} workers)",
        node.origin_host(),
        node.listen_addrs(),
        args.peers,
        args.workers
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("Shutting down...");

    node.stop().await;
    let stats = app.stats();
    log::info!(
        "diam-eap-serverd stopped ({} requests, {} answers, {} rejected busy)",
        stats.requests_received,
        stats.answers_sent,
        stats.too_busy
    );
    Ok(())
}

fn handle_request(app: &Application, request: &DiameterMessage) -> Option<DiameterMessage> {
    log::info!("{:?} got {}", std::thread::current().id(), request);
    Some(app.generate_answer(request, ResultCode::Success))
}

/// Initialize logging based on command line arguments
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
}
