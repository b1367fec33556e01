use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::distil::DistilArgs;
use config::load_config;

/// corefkd: distil a coreference teacher into a compact student
#[derive(Debug, Parser)]
#[command(name = "corefkd", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a student coreference model (optionally from a teacher) and
    /// evaluate it.
    ///
    /// MEMORY: the teacher encodes whole documents, so its activations grow
    /// with the longest document in a batch; lower --max-tokens-in-batch if
    /// training runs out of memory.
    Distil(DistilArgs),

    /// Download a model from Hugging Face Hub into the local cache.
    Pull {
        /// Hugging Face model id (e.g. `biu-nlp/f-coref`), optionally `@revision`.
        model_id: String,

        /// Git revision, branch, or commit hash.
        #[arg(long)]
        revision: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Distil(args) => {
            let results = commands::distil::run(args, &cfg).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Pull { model_id, revision } => {
            commands::pull::run(&model_id, revision.as_deref(), &cfg).await?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_distil_flags() {
        let cli = Cli::try_parse_from([
            "corefkd",
            "--log-format",
            "json",
            "distil",
            "-m",
            "org/student",
            "--teacher",
            "org/teacher",
            "--do-train",
            "--output-dir",
            "out",
            "--train-file",
            "train.jsonl",
        ])
        .unwrap();
        assert_eq!(cli.log_format, "json");
        match cli.command {
            Commands::Distil(args) => {
                assert_eq!(args.model_name_or_path, "org/student");
                assert_eq!(args.teacher.as_deref(), Some("org/teacher"));
                assert!(args.do_train);
                assert!(!args.overwrite_output_dir);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn distil_requires_a_model() {
        assert!(Cli::try_parse_from(["corefkd", "distil", "--do-train"]).is_err());
    }

    #[test]
    fn pull_takes_optional_revision() {
        let cli = Cli::try_parse_from(["corefkd", "pull", "biu-nlp/f-coref", "--revision", "v1"])
            .unwrap();
        match cli.command {
            Commands::Pull { model_id, revision } => {
                assert_eq!(model_id, "biu-nlp/f-coref");
                assert_eq!(revision.as_deref(), Some("v1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
