use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use versefind_embeddings::{EmbeddingProvider, OpenAIProvider};
use versefind_retrieval::{GeminiGenerator, Generator, RetrievalConfig, ServiceRegistry};

#[derive(Parser, Debug)]
#[command(
    name = "versefind",
    about = "Semantic verse search with guardrails, translation and query rewriting"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "VERSEFIND_CONFIG")]
    config: Option<PathBuf>,

    /// Corpus metadata JSON (overrides corpus.metadata_path)
    #[arg(long, env = "VERSEFIND_METADATA")]
    metadata: Option<PathBuf>,

    /// Corpus vectors JSON (overrides corpus.vectors_path)
    #[arg(long, env = "VERSEFIND_VECTORS")]
    vectors: Option<PathBuf>,

    /// Disable a stage by name for this run; may be repeated
    #[arg(long = "disable", value_name = "STAGE")]
    disabled: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the corpus for text
    Search {
        text: String,

        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
    },

    /// Find verses that speak to a described personal issue
    Therapy {
        issue: String,

        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
    },

    /// Show corpus size, capability availability and stage configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("versefind=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    let mut builder = ServiceRegistry::builder().with_embedder(embedder(&config));
    if let Some(generator) = generator(&config) {
        builder = builder.with_generator(generator);
    }
    let registry = builder
        .with_config(config)
        .initialize()
        .await
        .context("failed to initialize retrieval service")?;

    for stage in &cli.disabled {
        registry.set_stage_enabled(stage, false).await?;
    }

    match cli.command {
        Command::Search { text, k } => print_json(&registry.search(&text, k).await?),
        Command::Therapy { issue, k } => print_json(&registry.therapy_search(&issue, k).await?),
        Command::Status => print_json(&registry.status().await),
    }
}

async fn load_config(cli: &Cli) -> Result<RetrievalConfig> {
    let mut config = match &cli.config {
        Some(path) => RetrievalConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RetrievalConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(path) = &cli.metadata {
        config.corpus.metadata_path = Some(path.clone());
    }
    if let Some(path) = &cli.vectors {
        config.corpus.vectors_path = Some(path.clone());
    }
    Ok(config)
}

/// OpenAI embeddings, keyed from `OPENAI_API_KEY`. Without a key the registry
/// reports the embedder as unavailable.
fn embedder(config: &RetrievalConfig) -> Arc<dyn EmbeddingProvider> {
    let mut provider = OpenAIProvider::new();
    if let Some(model) = &config.embedding.model {
        provider = provider.with_model(model);
    }
    if let Some(url) = &config.embedding.base_url {
        provider = provider.with_base_url(url);
    }
    if let Some(dimensions) = config.embedding.dimensions {
        provider = provider.with_dimensions(dimensions);
    }
    Arc::new(provider)
}

/// Gemini, keyed from `GEMINI_API_KEY`.
fn generator(config: &RetrievalConfig) -> Option<Arc<dyn Generator>> {
    let mut generator = match GeminiGenerator::from_env() {
        Ok(generator) => generator,
        Err(e) => {
            warn!("generator unavailable: {e}");
            return None;
        }
    };
    if let Some(model) = &config.generation.model {
        generator = generator.with_model(model);
    }
    if let Some(url) = &config.generation.base_url {
        generator = generator.with_base_url(url);
    }
    info!("using generator model {}", generator.model());
    Some(Arc::new(generator))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
