use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ledger_importer::config::{ImportDoc, ImportList};
use ledger_importer::{Importer, RunReport};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(version, about = "Rule-driven ledger importer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import records from the working directory into the ledger files
    Import {
        /// Working directory holding the input files and ledger tree
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        workdir: PathBuf,

        /// Main ledger file, relative to the working directory
        #[arg(short, long, value_name = "FILE", default_value = "main.bean")]
        beanfile: PathBuf,

        /// Import configuration file, relative to the working directory
        #[arg(short, long, value_name = "FILE", default_value = "import.yaml")]
        config: PathBuf,

        /// Remove existing imported entries with no generated counterpart
        #[arg(long)]
        remove_dangling: bool,

        #[arg(short = 'l', long, value_enum, env = "LOG_LEVEL", default_value = "info")]
        log_level: LogLevel,
    },
    /// Emit the configuration JSON schemas
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Verbose => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

fn print_report(report: &RunReport, remove_dangling: bool) {
    let file_pad = 48;
    let id_pad = 32;

    println!("\nDeleted transactions");
    println!("{:file_pad$} | Id", "File");
    for txn in &report.deleted {
        let location = format!("{}:{}", txn.file.display(), txn.lineno);
        println!("{location:file_pad$} | {}", txn.id);
    }

    let dangling_action = if remove_dangling { "Delete" } else { "Ignored" };
    println!("\nDangling Transactions ({dangling_action})");
    println!("{:file_pad$} | Id", "File");
    for txn in &report.dangling {
        let location = format!("{}:{}", txn.file.display(), txn.lineno);
        println!("{location:file_pad$} | {}", txn.id);
    }

    println!("\nGenerated transactions");
    println!(
        "{:file_pad$} | {:id_pad$} | {:id_pad$} | {:10} | Narration",
        "File", "Id", "Source", "Date"
    );
    for txn in &report.generated {
        println!(
            "{:file_pad$} | {:id_pad$} | {:id_pad$} | {:10} | {}",
            txn.file,
            txn.id,
            txn.sources.join(":"),
            txn.date,
            txn.narration
        );
    }

    println!("\nUnprocessed transactions");
    println!(
        "{:file_pad$} | {:6} | {:id_pad$} | {:12} | {:10} | Desc",
        "File", "Line", "Id", "Extractor", "Date"
    );
    for txn in &report.unprocessed {
        println!(
            "{:file_pad$} | {:6} | {:id_pad$} | {:12} | {:10} | {}",
            txn.txn.file.as_deref().unwrap_or(""),
            txn.txn.lineno.map(|l| l.to_string()).unwrap_or_default(),
            txn.import_id,
            txn.txn.extractor,
            txn.txn
                .date
                .map(|date| date.to_string())
                .unwrap_or_default(),
            txn.txn.desc.as_deref().unwrap_or("")
        );
    }
}

fn emit_schemas() -> Result<()> {
    let doc_schema = schemars::schema_for!(ImportDoc);
    std::fs::write(
        "schema.json",
        serde_json::to_string_pretty(&doc_schema).context("Failed to serialize schema")?,
    )
    .context("Failed to write schema.json")?;
    let import_schema = schemars::schema_for!(ImportList);
    std::fs::write(
        "schema-import.json",
        serde_json::to_string_pretty(&import_schema).context("Failed to serialize schema")?,
    )
    .context("Failed to write schema-import.json")?;
    Ok(())
}

#[async_std::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Import {
            workdir,
            beanfile,
            config,
            remove_dangling,
            log_level,
        } => {
            tracing_subscriber::fmt()
                .with_max_level(LevelFilter::from(log_level))
                .init();
            let importer = Importer::new(&workdir, &beanfile, &config, remove_dangling)?;
            let report = importer.run().await?;
            print_report(&report, remove_dangling);
        }
        Commands::Schema => emit_schemas()?,
    }
    Ok(())
}
