use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use deckhand_apply::deploy;
use deckhand_core::{DeploymentTarget, ImageBuildProvenance};
use deckhand_kubehub::{DefaultClassifier, KubeCluster};

#[derive(Parser, Debug)]
#[command(name = "deckhand", version, about = "One-shot deployer for rendered Kubernetes manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the rendered manifest for the selected target and report the workload
    Deploy {
        /// Directory the manifest renderer wrote its output under
        #[arg(long = "out-dir", default_value = "target")]
        out_dir: PathBuf,
        /// Image build result as PROVIDER=IMAGE (e.g. docker=quay.io/acme/app:1.0)
        #[arg(long = "image-result", value_name = "PROVIDER=IMAGE")]
        image_results: Vec<String>,
        /// Candidate deployment target as PLATFORM/KIND, in priority order
        #[arg(long = "target", value_name = "PLATFORM/KIND")]
        targets: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("DECKHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DECKHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DECKHAND_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_image_result(s: &str) -> Result<ImageBuildProvenance> {
    let (provider, image) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid image result: {} (expect PROVIDER=IMAGE)", s))?;
    Ok(ImageBuildProvenance { provider: provider.to_string(), image: image.to_string() })
}

fn parse_target(s: &str) -> Result<DeploymentTarget> {
    let (platform, kind) = s
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid target: {} (expect PLATFORM/KIND, e.g. kubernetes/Deployment)", s))?;
    Ok(DeploymentTarget::new(platform, kind))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Deploy { out_dir, image_results, targets } => {
            let image_results = image_results
                .iter()
                .map(|s| parse_image_result(s))
                .collect::<Result<Vec<_>>>()?;
            let candidates = targets
                .iter()
                .map(|s| parse_target(s))
                .collect::<Result<Vec<_>>>()?;
            info!(out_dir = %out_dir.display(), candidates = candidates.len(), "deploy invoked");

            let cluster = KubeCluster::connect().await.context("connecting to the cluster")?;
            match deploy(&image_results, &candidates, &cluster, &DefaultClassifier, &out_dir).await {
                Ok(result) => match cli.output {
                    Output::Human => {
                        println!("Deployed: {}", result.name);
                        for (k, v) in &result.labels {
                            println!("  {k}={v}");
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                },
                Err(e) => {
                    error!(error = %e, "deploy failed");
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
