use clap::{Parser, Subcommand};
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct CapabilityConfig {
    pub backend: String, // "gemini" or "ollama"
    pub model: String,
    pub embedding_model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of schema chunks handed to the planner.
    pub top_k: usize,
    /// Minimum cosine similarity a chunk must reach to be kept.
    pub score_floor: f32,
    pub index_path: String,
    pub schema_docs_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    /// Upper bound on corrector invocations for one candidate.
    pub max_correction_attempts: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
    /// Rows kept in an ExecutionResult before truncation.
    pub max_display_rows: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvalConfig {
    pub cases_path: String,
    pub report_path: String,
    /// Labeled cases evaluated concurrently. 1 keeps runs strictly sequential.
    pub concurrency: usize,
    /// Scoring method: "sequence" (deterministic, offline) or "embedding".
    pub similarity: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub capability: CapabilityConfig,
    pub retrieval: RetrievalConfig,
    pub validation: ValidationConfig,
    pub database: DatabaseConfig,
    pub eval: EvalConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the capability backend ("gemini" or "ollama")
    #[arg(long)]
    pub backend: Option<String>,

    /// Override the database connection string
    #[arg(long)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer a single natural-language question
    Ask {
        /// The question to answer
        question: String,
        /// Print generated SQL and correction history alongside the answer
        #[arg(long)]
        show_details: bool,
    },
    /// Rebuild the persisted schema index from the schema documentation file
    BuildIndex,
    /// Run the evaluation harness over the labeled question set
    Eval,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        let mut found_file = args.config.is_some();
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/hcp-nlq/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    found_file = true;
                    break;
                }
            }
        }

        // No config file anywhere: run on defaults so CLI-only invocations work.
        let mut config: AppConfig = if found_file {
            config_builder.build()?.try_deserialize()?
        } else {
            AppConfig::default()
        };

        if let Some(backend) = &args.backend {
            config.capability.backend = backend.clone();
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capability: CapabilityConfig {
                backend: "gemini".to_string(),
                model: "gemini-2.0-flash".to_string(),
                embedding_model: "text-embedding-004".to_string(),
                api_key: None,
                api_url: None,
                timeout_secs: 60,
            },
            retrieval: RetrievalConfig {
                top_k: 2,
                score_floor: 0.0,
                index_path: "data/schema_index.json".to_string(),
                schema_docs_path: "data/schema_docs.json".to_string(),
            },
            validation: ValidationConfig {
                max_correction_attempts: 2,
            },
            database: DatabaseConfig {
                connection_string: "hcp.duckdb".to_string(),
                pool_size: 5,
                max_display_rows: 100,
            },
            eval: EvalConfig {
                cases_path: "data/eval_cases.json".to_string(),
                report_path: "evaluation_results.json".to_string(),
                concurrency: 1,
                similarity: "sequence".to_string(),
            },
        }
    }
}
