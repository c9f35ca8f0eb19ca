use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use hcp_nlq::capability::CapabilityManager;
use hcp_nlq::config::{AppConfig, CliArgs, Command};
use hcp_nlq::db::duckdb::DuckDbDatabase;
use hcp_nlq::eval::{
    load_cases, EmbeddingSimilarity, Evaluator, SequenceSimilarity, Similarity,
};
use hcp_nlq::index::retriever::SchemaRetriever;
use hcp_nlq::index::{load_schema_docs, SchemaIndex};
use hcp_nlq::pipeline::{PipelineResponse, QueryDetails, QueryPipeline, Question};
use hcp_nlq::util::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Initializing capability backend: {}",
        config.capability.backend
    );
    let capabilities = CapabilityManager::new(&config.capability)?;

    let index = Arc::new(SchemaIndex::open(&config.retrieval.index_path)?);

    match args.command {
        Command::BuildIndex => {
            info!(
                "Rebuilding schema index from {}",
                config.retrieval.schema_docs_path
            );
            let docs = load_schema_docs(&config.retrieval.schema_docs_path)?;
            index
                .rebuild(&docs, capabilities.embedding().as_ref())
                .await?;
            info!("Schema index written to {}", config.retrieval.index_path);
        }
        Command::Ask {
            question,
            show_details,
        } => {
            let pipeline = build_pipeline(&config, &capabilities, index).await?;
            let question = Question::new(question);

            match pipeline.process(&question).await {
                PipelineResponse::Answered { answer, details } => {
                    println!("{}", answer.text);
                    if let Some(table) = &answer.table {
                        println!("\n{}", table);
                    }
                    for caveat in &answer.caveats {
                        println!("Note: {}", caveat);
                    }
                    if show_details {
                        print_details(&details);
                    }
                }
                PipelineResponse::Rejected { reason, details } => {
                    println!("Request rejected: {}", reason);
                    if show_details {
                        print_details(&details);
                    }
                }
                PipelineResponse::Failed {
                    message,
                    reason_code,
                    details,
                } => {
                    println!("{}", message);
                    if show_details {
                        println!("\nFailure code: {}", reason_code);
                        print_details(&details);
                    }
                    std::process::exit(1);
                }
            }
        }
        Command::Eval => {
            let cases = load_cases(&config.eval.cases_path)?;
            info!(
                "Evaluating {} cases from {}",
                cases.len(),
                config.eval.cases_path
            );

            let similarity: Arc<dyn Similarity> = match config.eval.similarity.as_str() {
                "embedding" => Arc::new(EmbeddingSimilarity::new(capabilities.embedding())),
                _ => Arc::new(SequenceSimilarity),
            };

            let pipeline = Arc::new(build_pipeline(&config, &capabilities, index).await?);
            let evaluator = Evaluator::new(pipeline, similarity, config.eval.concurrency);

            let records = evaluator.run(&cases).await;
            evaluator.write_report(&records, &config.eval.report_path)?;
        }
    }

    Ok(())
}

async fn build_pipeline(
    config: &AppConfig,
    capabilities: &CapabilityManager,
    index: Arc<SchemaIndex>,
) -> Result<QueryPipeline, Box<dyn std::error::Error>> {
    if index.chunk_ids().await.is_empty() {
        error!(
            "Schema index at {} is empty; run `build-index` first",
            config.retrieval.index_path
        );
        return Err("schema index is empty".into());
    }

    let retriever = SchemaRetriever::new(index, capabilities.embedding(), &config.retrieval);
    let database = Arc::new(DuckDbDatabase::new(&config.database)?);

    Ok(QueryPipeline::new(
        config,
        capabilities.completion(),
        retriever,
        database,
    ))
}

fn print_details(details: &QueryDetails) {
    println!("\n-- Query details --");
    println!("Security check passed: {}", details.security_check_passed);
    if !details.retrieved_chunks.is_empty() {
        println!("Retrieved schema:");
        for (id, score) in &details.retrieved_chunks {
            println!("  {} (score {:.3})", id, score);
        }
    }
    if let Some(sql) = &details.original_sql {
        println!("Generated SQL: {}", sql);
    }
    if details.was_corrected {
        if let Some(sql) = &details.sql_query {
            println!("Corrected SQL: {}", sql);
        }
        println!("Correction attempts: {}", details.attempts);
    }
    println!("Valid: {}", details.is_valid);
}
