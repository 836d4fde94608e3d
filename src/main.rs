use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn, Level};

use knowledge_graph_builder::{
    collect_documents, Config, GraphStore, KnowledgePipeline, MemoryGraphStore, MergeReport,
    PipelineError,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graph snapshot file
    #[arg(short = 'g', long, global = true)]
    graph: Option<PathBuf>,

    /// Ollama host
    #[arg(short = 'e', long, global = true)]
    endpoint_host: Option<String>,

    /// Ollama model used for extraction and answering
    #[arg(short = 'm', long, global = true)]
    model: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add files, or directories of .md/.txt files, to the graph
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from the graph
    Ask { question: String },
    /// Print starter questions about the ingested material
    Suggest,
    /// Write concepts and relationships as JSON
    Export {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print node and edge counts
    Stats,
    /// Remove everything from the graph
    Clear,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(graph) = &args.graph {
        config.output.graph_path = graph.clone();
    }
    if let Some(host) = &args.endpoint_host {
        config.llm.host = host.clone();
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(level) = &args.log_level {
        config.processing.log_level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

fn print_report(document_id: &str, report: &MergeReport) {
    println!(
        "{}: {}/{} chunks merged, {} concepts created, {} updated, {} relationships created, {} merged",
        document_id,
        report.chunks_merged,
        report.chunks_total,
        report.concepts_created,
        report.concepts_updated,
        report.relationships_created,
        report.relationships_merged
    );
    for skipped in &report.skipped {
        println!("  skipped chunk {}: {}", skipped.sequence_index, skipped.reason);
    }
}

async fn ingest(
    pipeline: &KnowledgePipeline,
    store: &MemoryGraphStore,
    paths: &[PathBuf],
) -> Result<()> {
    let documents = collect_documents(paths)?;
    if documents.is_empty() {
        bail!("No supported documents found");
    }

    let cancellation_token = pipeline.cancellation_token();
    let on_signal = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping at the next chunk boundary");
            on_signal.cancel();
        }
    });

    let mut total = MergeReport::default();
    let mut last_error = None;
    for document in &documents {
        if cancellation_token.is_cancelled() {
            break;
        }
        match pipeline.ingest(&document.id, &document.text).await {
            Ok(report) => {
                print_report(&document.id, &report);
                total.absorb(report);
            }
            Err(e @ PipelineError::EmptyDocument { .. }) => {
                println!("{}: skipped, {}", document.id, e);
                last_error = Some(e);
            }
            Err(e) => {
                store.persist()?;
                return Err(e.into());
            }
        }
        store.persist()?;
    }

    if total.chunks_total == 0 {
        if let Some(e) = last_error {
            return Err(anyhow!("Nothing was ingested: {}", e));
        }
    }

    println!(
        "Ingested {} chunks ({} skipped){}",
        total.chunks_merged,
        total.skipped.len(),
        if total.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

async fn ask(pipeline: &KnowledgePipeline, store: &MemoryGraphStore, question: &str) -> Result<()> {
    match pipeline.ask(question).await {
        Ok(answer) => {
            println!("{}", answer.text);
            println!("\nConfidence: {:.2}", answer.confidence);
            if !answer.citations.is_empty() {
                let chunks = store.chunks()?;
                println!("\nSources:");
                for (i, id) in answer.citations.iter().enumerate() {
                    match chunks.iter().find(|c| c.id == *id) {
                        Some(chunk) => println!(
                            "  [{}] {} (chunk {})",
                            i + 1,
                            chunk.document_id,
                            chunk.sequence_index
                        ),
                        None => println!("  [{}] {}", i + 1, id),
                    }
                }
            }
            if !answer.concepts.is_empty() {
                println!("\nConcepts: {}", answer.concepts.join(", "));
            }
            Ok(())
        }
        Err(e) if e.is_insufficient_information() => {
            warn!(reason = %e, "Question not answered");
            println!("Insufficient information to answer this question.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let config = load_config(&args)?;

    let level = Level::from_str(&config.processing.log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(MemoryGraphStore::open(&config.output.graph_path)?);
    let pipeline = KnowledgePipeline::from_config(&config, store.clone())?;
    info!(
        graph = %config.output.graph_path.display(),
        model = %config.llm.model,
        "Pipeline ready"
    );

    match &args.command {
        Command::Ingest { paths } => ingest(&pipeline, &store, paths).await?,
        Command::Ask { question } => ask(&pipeline, &store, question).await?,
        Command::Suggest => {
            for question in pipeline.suggest_questions()? {
                println!("{}", question);
            }
        }
        Command::Export { output } => {
            let json = serde_json::to_string_pretty(&pipeline.export()?)?;
            match output {
                Some(path) => {
                    std::fs::write(path, json)?;
                    println!("Graph exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Stats => {
            let stats = pipeline.stats()?;
            println!("chunks: {}", stats.chunks);
            println!("concepts: {}", stats.concepts);
            println!("relationships: {}", stats.relationships);
            println!("mentions: {}", stats.mentions);
        }
        Command::Clear => {
            store.clear()?;
            store.persist()?;
            println!("Graph cleared");
        }
    }

    Ok(())
}
