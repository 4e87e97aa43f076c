// suggestion-orchestrator-rs/src/main.rs
// Command line entry point: run one request through the pipeline against
// the configured HTTP providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provider_sdk::config::{CompositeConfigProvider, EnvConfigProvider};
use provider_sdk::ProviderGateway;
use suggestion_orchestrator::{
    init_logging, ImageRef, LoggingConfig, Orchestrator, OrchestratorConfig, PerformanceMonitor,
    StreamEvent, StreamOptions, SuggestionRequest, SuggestionType, Tier, Tone,
};

#[derive(Parser)]
#[command(name = "suggest", version, about = "Generate ranked suggestions for a screenshot")]
struct Cli {
    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate suggestions for an image
    Run {
        /// Screenshot to analyze
        image: PathBuf,
        /// Free text context
        #[arg(long, default_value = "")]
        context: String,
        #[arg(long, default_value = "playful")]
        tone: String,
        #[arg(long = "type", default_value = "opener")]
        suggestion_type: String,
        /// Force a tier instead of letting the pipeline choose
        #[arg(long)]
        tier: Option<String>,
        /// Prefer the fast tier
        #[arg(long)]
        low_latency: bool,
        /// Print suggestions as they are streamed
        #[arg(long)]
        stream: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let env = EnvConfigProvider::new().with_prefix("SUGGEST");
    let mut logging = LoggingConfig::from_provider(&env);
    logging.json_format |= cli.json_logs;
    init_logging(Some(logging))?;

    let provider = CompositeConfigProvider::new()
        .with_provider(EnvConfigProvider::new().with_prefix("SUGGEST"));
    let config = OrchestratorConfig::from_provider(&provider)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            image,
            context,
            tone,
            suggestion_type,
            tier,
            low_latency,
            stream,
        } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let id = image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());

            let mut request = SuggestionRequest::new(ImageRef::new(id, bytes))
                .with_context(context)
                .with_tone(tone.parse::<Tone>()?)
                .with_suggestion_type(suggestion_type.parse::<SuggestionType>()?)
                .low_latency(low_latency);
            if let Some(tier) = tier {
                request = request.with_strategy(tier.parse::<Tier>()?);
            }

            let monitor = Arc::new(PerformanceMonitor::new(&config));
            let gateway = ProviderGateway::builder()
                .http_providers(&provider)
                .observer(monitor.clone())
                .build();
            let orchestrator = Orchestrator::builder()
                .config(config)
                .gateway(Arc::new(gateway))
                .monitor(monitor)
                .build()?;

            if stream {
                let mut receiver = orchestrator
                    .submit_streaming(request, StreamOptions::default())
                    .await?;
                while let Some(event) = receiver.next().await {
                    println!("{}", serde_json::to_string(&event)?);
                    if let StreamEvent::Errored { reason } = &event {
                        anyhow::bail!("stream failed: {}", reason);
                    }
                }
            } else {
                let response = orchestrator.submit(request).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }

            let health = serde_json::to_string(&orchestrator.health())?;
            tracing::debug!(health = %health, "Pipeline health");
            Ok(())
        }
    }
}
