//! KGR CLI - Command-line interface
//!
//! Usage:
//!   kgr resolve --input entities.json [--threshold 0.9] [--output out.json]
//!   kgr query --snapshot graph.json --org <id> --question <text> [--pin <id>]...
//!   kgr config

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kgr_core::{AppConfig, Entity, Hops, LoggingConfig};
use kgr_graph::{GraphSnapshot, MemoryGraphStore};
use kgr_rag::{CharRatioEstimator, ContextRequest, GraphRagRetriever};
use kgr_resolve::{EntityResolver, RejectedRecord, ResolutionBatch};
use kgr_vector::create_embedding_service;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kgr")]
#[command(about = "Entity resolution and graph retrieval for wealth-management knowledge graphs")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve duplicate entity records into canonical entities
    Resolve {
        /// JSON array of entity records
        #[arg(long)]
        input: PathBuf,

        /// Similarity threshold override
        #[arg(long)]
        threshold: Option<f32>,

        /// Compute missing embeddings with the configured embedding service
        #[arg(long)]
        embed: bool,

        /// Write the outcome here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Build a context bundle for a question
    Query {
        /// JSON graph snapshot: {"entities": [...], "relations": [...]}
        #[arg(long)]
        snapshot: PathBuf,

        /// Organization scope
        #[arg(long)]
        org: String,

        #[arg(long)]
        question: String,

        /// Token budget override
        #[arg(long)]
        budget: Option<usize>,

        /// Traversal depth (1 or 2)
        #[arg(long)]
        hops: Option<u8>,

        /// Restrict k-NN to an entity type; repeatable
        #[arg(long = "type")]
        types: Vec<String>,

        /// Traversal seed entity; repeatable
        #[arg(long = "pin")]
        pinned: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Resolve {
            input,
            threshold,
            embed,
            output,
        } => resolve(config, &input, threshold, embed, output.as_deref()).await,
        Commands::Query {
            snapshot,
            org,
            question,
            budget,
            hops,
            types,
            pinned,
        } => {
            let mut request = ContextRequest::new(org, question);
            request.token_budget = budget;
            request.hops = hops.map(Hops::try_from).transpose()?;
            request.types = types.into_iter().collect();
            request.pinned = pinned;
            query(config, &snapshot, &request).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

/// Workspace crates whose logs follow `logging.level`
const LOG_TARGETS: &[&str] = &[
    "kgr",
    "kgr_core",
    "kgr_vector",
    "kgr_graph",
    "kgr_resolve",
    "kgr_rag",
];

/// Filter used when `RUST_LOG` is unset: dependencies at warn, workspace at `level`
fn default_directives(level: &str) -> String {
    std::iter::once("warn".to_string())
        .chain(LOG_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Logs go to stderr; stdout carries the JSON result
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parse a JSON array of entities, keeping records that fail to deserialize as rejects
fn parse_records(content: &str) -> anyhow::Result<(Vec<Entity>, Vec<RejectedRecord>)> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(content).context("input must be a JSON array of entities")?;

    let mut entities = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    for (index, value) in values.into_iter().enumerate() {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{index}"));

        match serde_json::from_value::<Entity>(value) {
            Ok(entity) => entities.push(entity),
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "Unparseable record");
                rejected.push(RejectedRecord {
                    id,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok((entities, rejected))
}

async fn resolve(
    mut config: AppConfig,
    input: &Path,
    threshold: Option<f32>,
    embed: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(threshold) = threshold {
        config.resolution.similarity_threshold = threshold;
        config.validate()?;
    }

    let content = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let (entities, unparsed) = parse_records(&content)?;

    let mut batch = ResolutionBatch::ingest(entities);
    tracing::info!(
        batch_id = %batch.batch_id(),
        accepted = batch.len(),
        rejected = batch.rejected().len() + unparsed.len(),
        "Batch ingested"
    );

    if embed {
        let embedder = create_embedding_service(&config.embedding)?;
        batch.embed_missing(embedder.as_ref()).await?;
    }

    let mut outcome = EntityResolver::new(&config.resolution).run(batch)?;
    outcome.rejected.extend(unparsed);

    let json = serde_json::to_string_pretty(&outcome)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Outcome written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn query(config: AppConfig, snapshot: &Path, request: &ContextRequest) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(snapshot)
        .with_context(|| format!("failed to read {}", snapshot.display()))?;
    let snapshot: GraphSnapshot =
        serde_json::from_str(&content).context("snapshot must be {\"entities\", \"relations\"}")?;

    let store = Arc::new(MemoryGraphStore::from_snapshot(snapshot).await?);
    let embedder = create_embedding_service(&config.embedding)?;
    let retriever = GraphRagRetriever::new(embedder, store, Arc::new(CharRatioEstimator), &config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let bundle = retriever.retrieve(request, &cancel).await?;
    for degradation in &bundle.degradations {
        tracing::warn!(%degradation, "Context bundle degraded");
    }
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_query_arguments() {
        let cli = Cli::try_parse_from([
            "kgr", "query", "--snapshot", "g.json", "--org", "org-1", "--question", "who?",
            "--pin", "a", "--pin", "b", "--hops", "1", "--config", "kgr.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("kgr.toml")));
        match cli.command {
            Commands::Query { pinned, hops, .. } => {
                assert_eq!(pinned, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(hops, Some(1));
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_parse_records_keeps_unparseable() {
        let content = r#"[
            {"id": "a", "organization_id": "org-1", "types": ["Client"], "source_priority": 1,
             "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z"},
            {"id": "b", "organization_id": "org-1"},
            {"organization_id": "org-1"}
        ]"#;
        let (entities, rejected) = parse_records(content).unwrap();

        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, "a");
        let ids: Vec<_> = rejected.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "#2"]);
    }

    #[test]
    fn test_default_directives_cover_every_crate() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("warn,"));
        for target in ["kgr_graph", "kgr_vector", "kgr_resolve", "kgr_rag"] {
            assert!(directives.contains(&format!("{target}=debug")), "{directives}");
        }
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_parse_records_requires_array() {
        assert!(parse_records("{}").is_err());
    }
}
