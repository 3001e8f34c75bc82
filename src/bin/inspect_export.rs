use clap::Parser;
use nrg_datasense::logger::{Channel, LoggerLayout, RecordParser};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inspect-export")]
#[command(about = "Parse an NRG text export offline and print what would be ingested", long_about = None)]
struct Cli {
    /// Path to a .txt export
    file: PathBuf,

    /// Force a column layout instead of detecting it (legacy, symphonie-pro)
    #[arg(long)]
    layout: Option<LoggerLayout>,

    /// Number of records to print
    #[arg(long, default_value = "5")]
    limit: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let filename = cli
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or("file path has no file name")?;
    let reader = BufReader::new(File::open(&cli.file)?);

    let mut parser = RecordParser::new(reader, filename.as_str());
    if let Some(layout) = cli.layout {
        parser = parser.with_layout(layout);
    }

    println!("=== {} ===\n", cli.file.display());

    let mut shown = 0;
    for record in parser.by_ref() {
        if shown >= cli.limit {
            continue;
        }
        shown += 1;

        println!("{}", record.timestamp);
        for channel in Channel::ALL {
            println!("  {:<22} {}", channel.wire_name(), record.value(channel));
        }
    }

    let report = parser.finish();
    println!("\n=== Report ===");
    match report.layout {
        Some(layout) => println!("Layout:        {layout}"),
        None => println!("Layout:        (none)"),
    }
    match report.header_line {
        Some(line) => println!("Header line:   {line}"),
        None => println!("Header line:   not found"),
    }
    println!("Lines read:    {}", report.lines_read);
    println!("Accepted:      {}", report.accepted);
    println!("Skipped:       {}", report.skipped);

    if let Err(e) = report.check() {
        println!("\n{e}");
    }

    Ok(())
}
