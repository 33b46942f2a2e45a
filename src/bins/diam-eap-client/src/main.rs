//! Diameter EAP client
//!
//! Starts `count_of_clients` independent nodes (`client0.test.realm` ..),
//! each with a persistent peer towards the server. Every node waits for its
//! peer to open, sends one Diameter-EAP-Request, prints the answer and stops.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use diam_node::{
    answer_result, app_id, avp_code, eap_payload, Application, AuthRequestType, Avp,
    DiameterMessage, Node, DIAMETER_EAP_CMD,
};

const REALM: &str = "test.realm";

/// Diameter EAP test client
#[derive(Parser, Debug)]
#[command(name = "diam-eap-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Diameter EAP test client", long_about = None)]
struct Args {
    /// IP of the Diameter server
    #[arg(default_value = "127.0.0.1")]
    server_ip: IpAddr,

    /// Port the server listens on
    #[arg(default_value_t = diam_node::DIAMETER_PORT)]
    port: u16,

    /// Number of concurrent clients
    #[arg(default_value_t = 5)]
    count_of_clients: usize,

    /// Diameter identity of the server
    #[arg(long, default_value = "server.test.realm")]
    server_name: String,

    /// Seconds to wait for the server connection to open
    #[arg(long, default_value_t = 10)]
    ready_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'e', long, default_value = "warn")]
    log_level: String,

    /// Disable color output
    #[arg(short = 'm', long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut clients = Vec::with_capacity(args.count_of_clients);
    for number in 0..args.count_of_clients {
        let server_ip = args.server_ip;
        let port = args.port;
        let server_name = args.server_name.clone();
        let ready_timeout = Duration::from_secs(args.ready_timeout);
        clients.push(tokio::spawn(async move {
            run_client(number, server_ip, port, &server_name, ready_timeout).await
        }));
    }

    let mut failed = 0;
    for (number, client) in clients.into_iter().enumerate() {
        match client.await.context("client task panicked")? {
            Ok(()) => {}
            Err(e) => {
                log::error!("client{number}: {e:#}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} clients failed", args.count_of_clients);
    }
    Ok(())
}

async fn run_client(
    number: usize,
    server_ip: IpAddr,
    port: u16,
    server_name: &str,
    ready_timeout: Duration,
) -> Result<()> {
    let node = Node::with_identity(&format!("client{number}.{REALM}"), REALM)
        .context("creating Diameter node")?;
    let peer = node
        .add_peer(&format!("aaa://{server_name}:{port}"), Some(REALM), &[server_ip], true)
        .await
        .context("adding server peer")?;

    let app = Application::builder(app_id::EAP)
        .auth()
        .direct()
        .build()
        .context("building EAP application")?;
    node.add_application(&app, &[peer])
        .await
        .context("registering EAP application")?;

    node.start().await.context("starting Diameter node")?;

    let outcome = exchange(&app, server_name, number, ready_timeout).await;
    node.stop().await;

    let answer = outcome?;
    println!(
        "client{number}: {} (result {:?})",
        answer,
        answer_result(&answer)
    );
    Ok(())
}

async fn exchange(
    app: &Application,
    server_name: &str,
    number: usize,
    ready_timeout: Duration,
) -> Result<DiameterMessage> {
    app.wait_for_ready(Some(ready_timeout))
        .await
        .context("waiting for server connection")?;

    let der = app
        .new_request(DIAMETER_EAP_CMD)?
        .with_avp(Avp::identity(avp_code::DESTINATION_REALM, REALM))
        .with_avp(Avp::identity(avp_code::DESTINATION_HOST, server_name))
        .with_avp(Avp::unsigned32(avp_code::AUTH_APPLICATION_ID, app_id::EAP))
        .with_avp(Avp::unsigned32(
            avp_code::AUTH_REQUEST_TYPE,
            AuthRequestType::AuthorizeAuthenticate as u32,
        ))
        .with_avp(Avp::utf8(avp_code::USER_NAME, format!("user{number}@{REALM}")))
        .with_avp(eap_payload(vec![0x02, 0x00, 0x00, 0x05, 0x01]));

    app.send_request(der).await.context("sending DER")
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
        _ => log::LevelFilter::Warn,
    };
    builder.filter_level(level);
    builder.format_timestamp_millis();

    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }

    builder.init();
}
