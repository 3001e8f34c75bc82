use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use nrg_datasense::app::Services;
use nrg_datasense::config::Config;
use nrg_datasense::db::{self, FileSource};
use nrg_datasense::services::IngestRequest;
use nrg_datasense::utils::parse_tag_list;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bulk-ingest")]
#[command(about = "Ingest every NRG logger export (.txt / .rld) in a directory", long_about = None)]
struct Cli {
    /// Directory containing exports
    #[arg(long)]
    dir: PathBuf,

    /// Database connection string (defaults to DATABASE_URL or the service default)
    #[arg(long, env)]
    database_url: Option<String>,

    /// Comma-separated tags added to every file
    #[arg(long)]
    tags: Option<String>,

    /// Library category for every file
    #[arg(long)]
    category: Option<String>,

    /// Number of files ingested concurrently
    #[arg(long, default_value = "4")]
    parallel: usize,

    /// Skip confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if it exists (ignore errors if not found)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(url) = cli.database_url.clone() {
        config.database_url = url;
    }

    let files = list_exports(&cli.dir)?;
    if files.is_empty() {
        println!("No .txt or .rld exports found in {}", cli.dir.display());
        return Ok(());
    }

    if !cli.yes {
        println!("\nThis will ingest {} files into {}", files.len(), config.database_url);
        println!("Directory: {}", cli.dir.display());
        println!("\nContinue? [y/N]: ");

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Import cancelled.");
            return Ok(());
        }
    }

    let start_time = Instant::now();
    let pool = db::connect(&config.database_url).await?;
    let services = Services::build(&config, pool);
    let ingest_service = services.ingest_service;
    let tags = cli.tags.as_deref().map(parse_tag_list).unwrap_or_default();

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let results: Vec<(PathBuf, Result<usize, String>)> = stream::iter(files)
        .map(|path| {
            let service = ingest_service.clone();
            let tags = tags.clone();
            let category = cli.category.clone();
            let pb = pb.clone();
            async move {
                let outcome = match IngestRequest::read_from(&path).await {
                    Ok(request) => {
                        let mut request = request
                            .with_source(FileSource::LocalClient)
                            .with_tags(tags);
                        if let Some(category) = category {
                            request = request.with_category(category);
                        }
                        service
                            .ingest(request)
                            .await
                            .map(|summary| summary.records_added)
                            .map_err(|e| e.to_string())
                    }
                    Err(e) => Err(e.to_string()),
                };
                pb.inc(1);
                if let Some(name) = path.file_name() {
                    pb.set_message(name.to_string_lossy().into_owned());
                }
                (path, outcome)
            }
        })
        .buffer_unordered(cli.parallel.max(1))
        .collect()
        .await;

    pb.finish_with_message("done");

    let mut ingested = 0;
    let mut records = 0;
    for (path, outcome) in &results {
        match outcome {
            Ok(added) => {
                ingested += 1;
                records += added;
            }
            Err(e) => {
                error!("{}: {}", path.display(), e);
                println!("  FAILED {}: {}", path.display(), e);
            }
        }
    }

    info!("Bulk ingest finished");
    println!("\n=== Bulk Ingest Summary ===");
    println!("Files ingested: {}/{}", ingested, results.len());
    println!("Records added:  {records}");
    println!("Failed:         {}", results.len() - ingested);
    println!("Duration:       {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}

fn list_exports(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("txt") || ext.eq_ignore_ascii_case("rld"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
