use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use wireguard_operator::{
    config::{
        Images, OperatorConfig, WebhookConfig, GENERATOR_IMAGE, RESULTS_IMAGE, WIREGUARD_IMAGE,
    },
    daemon,
    pia::{self, ClientConfig},
};
// Main entrypoint for operator

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log format: logfmt, pretty, json or compact
    #[arg(long, env = "LOGGER", default_value = "logfmt", global = true)]
    logger: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers and, when TLS material is given, the pod webhook
    Run(RunArgs),
    /// Exchange the configured credentials for an API token and print it
    Token(PiaArgs),
    /// Print the preferred region, or the fastest one
    Region(PiaArgs),
    /// Look up dedicated IP assignments
    Dip {
        #[command(flatten)]
        args: PiaArgs,
        #[arg(required = true)]
        tokens: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, env = "GENERATOR_IMAGE", default_value = GENERATOR_IMAGE)]
    generator_image: String,
    #[arg(long, env = "RESULTS_IMAGE", default_value = RESULTS_IMAGE)]
    results_image: String,
    #[arg(long, env = "WIREGUARD_IMAGE", default_value = WIREGUARD_IMAGE)]
    wireguard_image: String,
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,
    #[arg(long, env = "WEBHOOK_TLS_CERT", requires = "webhook_tls_key")]
    webhook_tls_cert: Option<PathBuf>,
    #[arg(long, env = "WEBHOOK_TLS_KEY", requires = "webhook_tls_cert")]
    webhook_tls_key: Option<PathBuf>,
}

impl From<RunArgs> for OperatorConfig {
    fn from(args: RunArgs) -> Self {
        let webhook = args
            .webhook_tls_cert
            .zip(args.webhook_tls_key)
            .map(|(tls_cert, tls_key)| WebhookConfig {
                addr: args.webhook_addr,
                tls_cert,
                tls_key,
            });

        OperatorConfig {
            images: Images {
                generator: args.generator_image,
                results: args.results_image,
                wireguard: args.wireguard_image,
            },
            webhook,
        }
    }
}

#[derive(Args)]
struct PiaArgs {
    #[arg(long, env = "PIA_USER")]
    username: Option<String>,
    #[arg(long, env = "PIA_PASS", hide_env_values = true)]
    password: Option<String>,
    /// Pre-issued token, skips the credential exchange
    #[arg(long, env = "PIA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, env = "PREFERRED_REGION")]
    preferred_region: Option<String>,
    /// Only consider regions that allow port forwarding
    #[arg(long, env = "PIA_PF")]
    port_forward: bool,
    /// Per-server probe timeout in (fractional) seconds
    #[arg(long, env = "MAX_LATENCY", default_value = "0.05", value_parser = parse_seconds)]
    max_latency: Duration,
}

fn parse_seconds(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

impl From<PiaArgs> for ClientConfig {
    fn from(args: PiaArgs) -> Self {
        ClientConfig {
            username: args.username,
            password: args.password,
            token: args.token,
            preferred_region: args.preferred_region,
            port_forward: args.port_forward,
            probe_timeout: Some(args.max_latency),
            ..Default::default()
        }
    }
}

fn init_logging(logger_env: &str) -> Result<()> {
    let logfmt_logger = tracing_logfmt::layer().boxed();

    let pretty_logger = tracing_subscriber::fmt::layer().pretty().boxed();

    let json_logger = tracing_subscriber::fmt::layer().json().boxed();

    let compact_logger = tracing_subscriber::fmt::layer().compact().boxed();

    let logger = match logger_env {
        "logfmt" => logfmt_logger,
        "pretty" => pretty_logger,
        "json" => json_logger,
        "compact" => compact_logger,
        _ => logfmt_logger,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("tower=off".parse()?)
        .add_directive("hyper=error".parse()?)
        .add_directive("kube_client=info".parse()?)
        .add_directive("h2=error".parse()?)
        .add_directive("tokio_util=error".parse()?)
        .add_directive("rustls=error".parse()?);

    let collector = Registry::default().with(logger).with(env_filter);
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.logger)?;

    // kube, reqwest and the webhook server share one process-wide provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| eyre!("failed to install the rustls crypto provider"))?;

    match cli.command {
        Command::Run(args) => {
            info!(
                "WireGuard Operator, version {}",
                env!("CARGO_PKG_VERSION")
            );
            info!("Starting up...");
            daemon::run(args.into()).await
        }
        Command::Token(args) => {
            let client = pia::Client::new(args.into())?;
            println!("{}", client.token().await?);
            Ok(())
        }
        Command::Region(args) => {
            let client = pia::Client::new(args.into())?;
            let selected = client
                .resolve_region()
                .await?
                .ok_or_else(|| eyre!("no region answered the latency probe"))?;
            match selected.latency {
                Some(latency) => println!(
                    "{}\t{}\t{}\t{}ms",
                    selected.region.id,
                    selected.region.name,
                    latency.server_ip,
                    latency.time.as_millis()
                ),
                None => println!("{}\t{}", selected.region.id, selected.region.name),
            }
            Ok(())
        }
        Command::Dip { args, tokens } => {
            let client = pia::Client::new(args.into())?;
            let assignments = client.get_dip(&tokens).await?;
            for dip in assignments.iter().filter(|dip| !dip.is_active()) {
                warn!(id = %dip.id, status = %dip.status, "Dedicated IP is not active");
            }
            println!("{}", serde_json::to_string_pretty(&assignments)?);
            Ok(())
        }
    }
}
